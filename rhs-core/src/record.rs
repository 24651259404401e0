//! Record registry
//!
//! Records are named, shared handles which services publish for others to find. A consumer may
//! [`open`] a record before it is created: the call blocks until the producer calls [`create`].
//!
//! ```
//! use std::sync::Arc;
//!
//! rhs_core::record::create("answer", Arc::new(42u32));
//! let answer = rhs_core::record::open::<u32>("answer");
//! assert_eq!(42, *answer);
//! rhs_core::record::close("answer");
//! assert!(rhs_core::record::destroy("answer"));
//! ```

use core::any::Any;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock};

use crate::event_flag::{EventFlag, FlagOptions};
use crate::kernel::{lock_state, WAIT_FOREVER};
use crate::{rhs_assert, rhs_crash};

const RECORD_READY: u32 = 1 << 0;

type RecordData = Arc<dyn Any + Send + Sync>;

#[derive(Debug)]
struct RecordSlot {
    flags: EventFlag,
    data: OnceLock<RecordData>,
}

#[derive(Debug)]
struct RecordEntry {
    slot: Arc<RecordSlot>,
    holders: usize,
}

impl RecordEntry {
    fn new() -> Self {
        Self {
            slot: Arc::new(RecordSlot {
                flags: EventFlag::new(),
                data: OnceLock::new(),
            }),
            holders: 0,
        }
    }
}

/// A directory of named records
#[derive(Debug, Default)]
pub struct RecordRegistry {
    records: Mutex<BTreeMap<String, RecordEntry>>,
}

impl RecordRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns true if a record with this name has been created
    ///
    /// Records which are only awaited by [`RecordRegistry::open`] do not exist yet.
    pub fn exists(&self, name: &str) -> bool {
        lock_state(&self.records)
            .get(name)
            .is_some_and(|e| e.slot.data.get().is_some())
    }

    /// Publish `data` under `name`, releasing any thread blocked opening it
    ///
    /// Creating the same record twice crashes.
    pub fn create<T: Any + Send + Sync>(&self, name: &str, data: Arc<T>) {
        let slot = {
            let mut records = lock_state(&self.records);
            records
                .entry(name.to_owned())
                .or_insert_with(RecordEntry::new)
                .slot
                .clone()
        };
        if slot.data.set(data).is_err() {
            rhs_crash!("Record {name} already created");
        }
        slot.flags.set(RECORD_READY).ok();
        log::debug!(target: "Record", "{name} created");
    }

    /// Remove a record
    ///
    /// Returns false, leaving the record in place, while anyone holds it open. Destroying an
    /// unknown record crashes.
    pub fn destroy(&self, name: &str) -> bool {
        let mut records = lock_state(&self.records);
        let Some(entry) = records.get(name) else {
            drop(records);
            rhs_crash!("Record {name} does not exist");
        };
        if entry.holders == 0 {
            records.remove(name);
            true
        } else {
            false
        }
    }

    /// Open a record, blocking until it has been created
    ///
    /// Every open must be paired with a [`RecordRegistry::close`]. Crashes if the record holds a
    /// type other than `T`.
    pub fn open<T: Any + Send + Sync>(&self, name: &str) -> Arc<T> {
        let slot = {
            let mut records = lock_state(&self.records);
            let entry = records
                .entry(name.to_owned())
                .or_insert_with(RecordEntry::new);
            if entry.slot.data.get().is_some_and(|data| !data.is::<T>()) {
                drop(records);
                rhs_crash!("Record {name} holds a different type");
            }
            entry.holders += 1;
            entry.slot.clone()
        };
        if let Err(e) = slot.flags.wait(
            RECORD_READY,
            FlagOptions::WAIT_ANY | FlagOptions::NO_CLEAR,
            WAIT_FOREVER,
        ) {
            rhs_crash!("Failed to open record {name}: {e}");
        }
        let Some(data) = slot.data.get() else {
            rhs_crash!("Record {name} is ready without data");
        };
        match data.clone().downcast::<T>() {
            Ok(data) => data,
            Err(_) => {
                // Created with another type while we waited
                self.close(name);
                rhs_crash!("Record {name} holds a different type")
            }
        }
    }

    /// Release a record obtained from [`RecordRegistry::open`]
    pub fn close(&self, name: &str) {
        let mut records = lock_state(&self.records);
        let Some(entry) = records.get_mut(name) else {
            drop(records);
            rhs_crash!("Record {name} does not exist");
        };
        rhs_assert!(entry.holders > 0, "Record {name} closed more often than opened");
        entry.holders -= 1;
    }

    /// Open a record, closing it again when the guard is dropped
    pub fn open_guard<T: Any + Send + Sync>(&self, name: &str) -> RecordGuard<'_, T> {
        let data = self.open(name);
        RecordGuard {
            registry: self,
            name: name.to_owned(),
            data,
        }
    }

    /// Number of open handles on a record
    pub fn holders(&self, name: &str) -> usize {
        lock_state(&self.records)
            .get(name)
            .map(|e| e.holders)
            .unwrap_or(0)
    }
}

/// An open record, closed on drop
#[derive(Debug)]
pub struct RecordGuard<'a, T> {
    registry: &'a RecordRegistry,
    name: String,
    data: Arc<T>,
}

impl<T> RecordGuard<'_, T> {
    /// Get a shared handle to the record data, which outlives the guard
    pub fn handle(&self) -> Arc<T> {
        self.data.clone()
    }
}

impl<T> Deref for RecordGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T> Drop for RecordGuard<'_, T> {
    fn drop(&mut self) {
        self.registry.close(&self.name);
    }
}

static RECORDS: OnceLock<RecordRegistry> = OnceLock::new();

/// The process wide registry
pub fn registry() -> &'static RecordRegistry {
    RECORDS.get_or_init(RecordRegistry::new)
}

/// Set up the process wide registry
///
/// Called once at boot. The other functions set it up on first use as well.
pub fn init() {
    registry();
}

/// See [`RecordRegistry::exists`]
pub fn exists(name: &str) -> bool {
    registry().exists(name)
}

/// See [`RecordRegistry::create`]
pub fn create<T: Any + Send + Sync>(name: &str, data: Arc<T>) {
    registry().create(name, data)
}

/// See [`RecordRegistry::destroy`]
pub fn destroy(name: &str) -> bool {
    registry().destroy(name)
}

/// See [`RecordRegistry::open`]
pub fn open<T: Any + Send + Sync>(name: &str) -> Arc<T> {
    registry().open(name)
}

/// See [`RecordRegistry::close`]
pub fn close(name: &str) {
    registry().close(name)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertables::assert_lt;

    use super::*;

    #[test]
    fn test_open_blocks_until_create() {
        let registry = Arc::new(RecordRegistry::new());
        let opener = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let value = registry.open::<String>("service");
                registry.close("service");
                value
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!opener.is_finished());
        assert!(!registry.exists("service"));
        assert_eq!(1, registry.holders("service"));

        registry.create("service", Arc::new("hello".to_string()));
        assert_eq!("hello", opener.join().unwrap().as_str());
        assert!(registry.exists("service"));
        assert_eq!(0, registry.holders("service"));
    }

    #[test]
    fn test_destroy_refused_while_held() {
        let registry = RecordRegistry::new();
        registry.create("held", Arc::new(7u8));
        let guard = registry.open_guard::<u8>("held");
        assert_eq!(7, *guard);
        assert!(!registry.destroy("held"));
        assert!(registry.exists("held"));
        drop(guard);
        assert!(registry.destroy("held"));
        assert!(!registry.exists("held"));
    }

    #[test]
    #[serial_test::serial(saved_log)]
    fn test_misuse_crashes() {
        let registry = RecordRegistry::new();
        registry.create("once", Arc::new(1u32));
        let twice = std::panic::catch_unwind(|| registry.create("once", Arc::new(2u32)));
        assert!(twice.is_err());
        let wrong_type = std::panic::catch_unwind(|| registry.open::<u8>("once"));
        assert!(wrong_type.is_err());
        assert_eq!(0, registry.holders("once"));
        let unknown = std::panic::catch_unwind(|| registry.destroy("missing"));
        assert!(unknown.is_err());
    }

    #[test]
    #[serial_test::serial(saved_log)]
    fn test_waiting_opener_of_wrong_type_crashes() {
        let registry = Arc::new(RecordRegistry::new());
        let opener = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.open::<u8>("late"))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(1, registry.holders("late"));
        registry.create("late", Arc::new(1u32));
        assert!(opener.join().is_err());
        assert_eq!(0, registry.holders("late"));
        assert!(registry.destroy("late"));
    }

    #[test]
    fn test_many_openers_released_by_one_create() {
        const OPENERS: usize = 5;
        let registry = Arc::new(RecordRegistry::new());
        let openers: Vec<_> = (0..OPENERS)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.open::<Vec<u16>>("shared"))
            })
            .collect();

        let start = std::time::Instant::now();
        while registry.holders("shared") < OPENERS {
            assert_lt!(start.elapsed(), Duration::from_secs(2));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(openers.iter().all(|o| !o.is_finished()));
        assert!(!registry.exists("shared"));
        assert!(!registry.destroy("shared"));

        let data = Arc::new(vec![1u16, 2, 3]);
        registry.create("shared", data.clone());
        for opener in openers {
            let opened = opener.join().unwrap();
            assert!(Arc::ptr_eq(&data, &opened));
            registry.close("shared");
        }
        assert_eq!(0, registry.holders("shared"));
        assert!(registry.destroy("shared"));
    }
}
