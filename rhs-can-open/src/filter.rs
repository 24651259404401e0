//! CAN ids watched for diagnostic logging
//!
//! The receive interrupt logs every frame whose id is in the list. The list is edited from the
//! `can_open` CLI command.

use core::cell::RefCell;

use critical_section::Mutex;

/// A list of CAN ids, readable from interrupt context
#[derive(Debug)]
pub struct FilterList {
    ids: Mutex<RefCell<Vec<u16>>>,
}

impl Default for FilterList {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            ids: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Add an id, returning false if it was already watched
    pub fn add(&self, id: u16) -> bool {
        critical_section::with(|cs| {
            let mut ids = self.ids.borrow_ref_mut(cs);
            if ids.contains(&id) {
                false
            } else {
                ids.push(id);
                true
            }
        })
    }

    /// Remove an id, returning false if it was not watched
    pub fn remove(&self, id: u16) -> bool {
        critical_section::with(|cs| {
            let mut ids = self.ids.borrow_ref_mut(cs);
            let len = ids.len();
            ids.retain(|&i| i != id);
            ids.len() != len
        })
    }

    /// Remove all ids
    pub fn clear(&self) {
        critical_section::with(|cs| self.ids.borrow_ref_mut(cs).clear());
    }

    /// Returns true if frames with this id are logged
    pub fn contains(&self, id: u32) -> bool {
        critical_section::with(|cs| self.ids.borrow_ref(cs).iter().any(|&i| i as u32 == id))
    }

    /// The watched ids, in the order they were added
    pub fn ids(&self) -> Vec<u16> {
        critical_section::with(|cs| self.ids.borrow_ref(cs).clone())
    }
}
