//! Single use rendezvous between a caller and a worker thread
//!
//! The caller creates the lock in the locked state, hands a clone to the worker along with the
//! request, and waits. The worker unlocks it once the request is done.

use std::sync::Arc;

use crate::event_flag::{EventFlag, FlagOptions};
use crate::kernel::WAIT_FOREVER;
use crate::status::Result;

const API_LOCK_EVENT: u32 = 1 << 0;

/// A one-shot lock released by a worker
#[derive(Debug, Clone)]
pub struct ApiLock {
    flag: Arc<EventFlag>,
}

impl ApiLock {
    /// Create a new lock in the locked state
    pub fn new_locked() -> Self {
        Self {
            flag: Arc::new(EventFlag::new()),
        }
    }

    /// Release the waiter
    pub fn unlock(&self) {
        // bit 0 is always a valid flag
        self.flag.set(API_LOCK_EVENT).ok();
    }

    /// Block until [`ApiLock::unlock`] is called
    pub fn wait_unlock(&self) -> Result<()> {
        self.flag
            .wait(API_LOCK_EVENT, FlagOptions::WAIT_ANY, WAIT_FOREVER)
            .map(|_| ())
    }

    /// Block until unlocked, then drop the lock
    pub fn wait_unlock_and_free(self) -> Result<()> {
        self.wait_unlock()
    }

    /// Returns true until the lock is released
    pub fn is_locked(&self) -> bool {
        self.flag.get() & API_LOCK_EVENT == 0
    }

    /// Put the lock back into the locked state
    pub fn relock(&self) {
        self.flag.clear(API_LOCK_EVENT).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous() {
        let lock = ApiLock::new_locked();
        assert!(lock.is_locked());
        let worker = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                lock.unlock();
            })
        };
        lock.clone().wait_unlock_and_free().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_relock() {
        let lock = ApiLock::new_locked();
        lock.unlock();
        assert!(!lock.is_locked());
        lock.relock();
        assert!(lock.is_locked());
    }
}
