//! Thread mutex with owner tracking
//!
//! Unlike [`std::sync::Mutex`] this does not wrap data. It guards a critical region between
//! threads and reports its owner, which makes it usable as the lock behind C style APIs such as
//! the SDO transaction lock.

use std::sync::{Condvar, Mutex as StdMutex};
use std::thread::ThreadId;

use crate::kernel::{is_irq, lock_state, wait_while};
use crate::status::{Error, Result};

/// Mutex flavour
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexKind {
    /// May be taken once by its owner. Taking it again crashes.
    Normal,
    /// May be taken repeatedly by its owner, and must be released as many times
    Recursive,
}

#[derive(Debug)]
struct MutexState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// A mutex which threads acquire and release explicitly
#[derive(Debug)]
pub struct Mutex {
    kind: MutexKind,
    state: StdMutex<MutexState>,
    released: Condvar,
}

impl Mutex {
    /// Create a new, unowned mutex
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            state: StdMutex::new(MutexState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// The flavour of this mutex
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Acquire the mutex, waiting up to `timeout` ms
    pub fn acquire(&self, timeout: u32) -> Result<()> {
        if is_irq() {
            return Err(Error::NotAllowedFromInterrupt);
        }
        let me = std::thread::current().id();
        let state = lock_state(&self.state);
        if state.owner == Some(me) {
            match self.kind {
                MutexKind::Recursive => {
                    let mut state = state;
                    state.depth += 1;
                    return Ok(());
                }
                MutexKind::Normal => {
                    drop(state);
                    crate::rhs_crash!("Mutex is already held by the calling thread");
                }
            }
        }
        let (mut state, timed_out) =
            wait_while(&self.released, state, timeout, |s| s.owner.is_some());
        if timed_out {
            return Err(Error::from_timeout(timeout));
        }
        state.owner = Some(me);
        state.depth = 1;
        Ok(())
    }

    /// Release the mutex
    ///
    /// Fails with `ResourceUnavailable` if the calling thread is not the owner.
    pub fn release(&self) -> Result<()> {
        if is_irq() {
            return Err(Error::NotAllowedFromInterrupt);
        }
        let me = std::thread::current().id();
        let mut state = lock_state(&self.state);
        if state.owner != Some(me) {
            return Err(Error::ResourceUnavailable);
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_all();
        }
        Ok(())
    }

    /// The thread currently holding the mutex
    pub fn owner(&self) -> Option<ThreadId> {
        lock_state(&self.state).owner
    }

    /// Acquire the mutex, returning a guard which releases it when dropped
    pub fn guard(&self, timeout: u32) -> Result<MutexGuard<'_>> {
        self.acquire(timeout)?;
        Ok(MutexGuard { mutex: self })
    }
}

/// Releases the [`Mutex`] it was created from when dropped
#[derive(Debug)]
#[must_use = "the mutex is released when the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // Only fails if the guard was moved to another thread
        if let Err(e) = self.mutex.release() {
            log::error!(target: "Mutex", "Failed to release mutex: {e}");
        }
    }
}
