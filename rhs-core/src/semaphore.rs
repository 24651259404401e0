//! Counting semaphore
//!

use std::sync::{Condvar, Mutex};

use crate::kernel::{is_irq, lock_state, wait_while};
use crate::status::{Error, Result};

/// A counting semaphore; binary when `max_count` is 1
#[derive(Debug)]
pub struct Semaphore {
    max_count: u32,
    count: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `initial` of `max_count` tokens
    pub fn new(max_count: u32, initial: u32) -> Self {
        crate::rhs_assert!(max_count > 0 && initial <= max_count);
        Self {
            max_count,
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Take a token, waiting up to `timeout` ms
    ///
    /// From interrupt context only a poll (timeout 0) is accepted.
    pub fn acquire(&self, timeout: u32) -> Result<()> {
        if is_irq() && timeout != 0 {
            return Err(Error::InvalidParameter);
        }
        let count = lock_state(&self.count);
        let (mut count, timed_out) = wait_while(&self.available, count, timeout, |c| *c == 0);
        if timed_out {
            return Err(Error::from_timeout(timeout));
        }
        *count -= 1;
        Ok(())
    }

    /// Return a token
    ///
    /// Fails with `ResourceUnavailable` if all tokens are already available.
    pub fn release(&self) -> Result<()> {
        let mut count = lock_state(&self.count);
        if *count >= self.max_count {
            return Err(Error::ResourceUnavailable);
        }
        *count += 1;
        drop(count);
        self.available.notify_one();
        Ok(())
    }

    /// Tokens currently available
    pub fn count(&self) -> u32 {
        *lock_state(&self.count)
    }

    /// Tokens currently taken
    pub fn space(&self) -> u32 {
        self.max_count - self.count()
    }
}
