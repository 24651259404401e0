//! Bounded FIFO message queue
//!

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::kernel::{is_irq, lock_state, wait_while};
use crate::status::{Error, Result};

/// A fixed capacity FIFO of `T`
///
/// From interrupt context only non-blocking calls (timeout 0) are accepted.
#[derive(Debug)]
pub struct MessageQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> MessageQueue<T> {
    /// Create a queue holding up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        crate::rhs_assert!(capacity > 0);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn check_isr_timeout(timeout: u32) -> Result<()> {
        if is_irq() && timeout != 0 {
            Err(Error::InvalidParameter)
        } else {
            Ok(())
        }
    }

    /// Append a message, waiting up to `timeout` ms for space
    ///
    /// The message is dropped if it could not be queued.
    pub fn put(&self, message: T, timeout: u32) -> Result<()> {
        Self::check_isr_timeout(timeout)?;
        let items = lock_state(&self.items);
        let (mut items, timed_out) = wait_while(&self.not_full, items, timeout, |items| {
            items.len() >= self.capacity
        });
        if timed_out {
            return Err(Error::from_timeout(timeout));
        }
        items.push_back(message);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest message, waiting up to `timeout` ms for one to arrive
    pub fn get(&self, timeout: u32) -> Result<T> {
        Self::check_isr_timeout(timeout)?;
        let items = lock_state(&self.items);
        let (mut items, timed_out) =
            wait_while(&self.not_empty, items, timeout, |items| items.is_empty());
        if timed_out {
            return Err(Error::from_timeout(timeout));
        }
        let message = items.pop_front().ok_or(Error::Unspecified)?;
        drop(items);
        self.not_full.notify_one();
        Ok(message)
    }

    /// Maximum number of messages
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of one message in bytes
    pub fn message_size(&self) -> usize {
        core::mem::size_of::<T>()
    }

    /// Number of queued messages
    pub fn count(&self) -> usize {
        lock_state(&self.items).len()
    }

    /// Number of free slots
    pub fn space(&self) -> usize {
        self.capacity - self.count()
    }

    /// Drop all queued messages
    pub fn reset(&self) -> Result<()> {
        if is_irq() {
            return Err(Error::NotAllowedFromInterrupt);
        }
        lock_state(&self.items).clear();
        self.not_full.notify_all();
        Ok(())
    }
}
