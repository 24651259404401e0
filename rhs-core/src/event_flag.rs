//! Event flags: a bitfield threads can wait on
//!

use std::sync::{Condvar, Mutex};

use crate::kernel::{is_irq, lock_state, wait_while};
use crate::status::{Error, Result};

/// Number of usable bits in an [`EventFlag`]
pub const EVENT_FLAG_BITS: u32 = 24;

/// Options for [`EventFlag::wait`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FlagOptions(u8);

impl FlagOptions {
    /// Return when any of the requested bits is set
    pub const WAIT_ANY: FlagOptions = FlagOptions(0);
    /// Return only when all requested bits are set
    pub const WAIT_ALL: FlagOptions = FlagOptions(1);
    /// Leave the bits set on return
    pub const NO_CLEAR: FlagOptions = FlagOptions(2);

    /// Returns true if all options in `other` are set
    pub const fn contains(&self, other: FlagOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for FlagOptions {
    type Output = FlagOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        FlagOptions(self.0 | rhs.0)
    }
}

/// A set of event bits which threads and interrupts can set, and threads can wait on
#[derive(Debug)]
pub struct EventFlag {
    mask: u32,
    flags: Mutex<u32>,
    changed: Condvar,
}

impl Default for EventFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFlag {
    /// Create a new event flag with [`EVENT_FLAG_BITS`] usable bits, all clear
    pub const fn new() -> Self {
        Self::with_bits(EVENT_FLAG_BITS)
    }

    /// Create an event flag with `bits` usable bits
    ///
    /// Panics unless `bits` is in 1..=31.
    pub const fn with_bits(bits: u32) -> Self {
        assert!(bits > 0 && bits < 32);
        Self {
            mask: (1u32 << bits) - 1,
            flags: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn check_flags(&self, flags: u32) -> Result<()> {
        if flags & !self.mask != 0 {
            log::error!(target: "EventFlag", "Invalid flags 0x{flags:08X}");
            Err(Error::InvalidParameter)
        } else {
            Ok(())
        }
    }

    /// Set bits, waking any waiter whose condition is now satisfied
    ///
    /// Returns the flags after setting. Allowed from interrupt context.
    pub fn set(&self, flags: u32) -> Result<u32> {
        self.check_flags(flags)?;
        let mut current = lock_state(&self.flags);
        *current |= flags;
        let result = *current;
        drop(current);
        self.changed.notify_all();
        Ok(result)
    }

    /// Clear bits
    ///
    /// Returns the flags before clearing. Allowed from interrupt context.
    pub fn clear(&self, flags: u32) -> Result<u32> {
        self.check_flags(flags)?;
        let mut current = lock_state(&self.flags);
        let before = *current;
        *current &= !flags;
        Ok(before)
    }

    /// Get the current flags
    pub fn get(&self) -> u32 {
        *lock_state(&self.flags)
    }

    /// Wait for `flags` to be set
    ///
    /// With [`FlagOptions::WAIT_ALL`], every bit in `flags` must be set; otherwise any one is
    /// enough. Unless [`FlagOptions::NO_CLEAR`] is given, the awaited bits are cleared on return.
    /// Returns the flags as they were before clearing.
    ///
    /// `timeout` is in milliseconds; [`WAIT_FOREVER`](crate::kernel::WAIT_FOREVER) blocks until
    /// the condition is met and `0` only polls.
    pub fn wait(&self, flags: u32, options: FlagOptions, timeout: u32) -> Result<u32> {
        if is_irq() {
            return Err(Error::NotAllowedFromInterrupt);
        }
        self.check_flags(flags)?;
        if flags == 0 {
            return Err(Error::InvalidParameter);
        }
        let wait_all = options.contains(FlagOptions::WAIT_ALL);
        let satisfied = |current: u32| {
            if wait_all {
                current & flags == flags
            } else {
                current & flags != 0
            }
        };

        let guard = lock_state(&self.flags);
        let (mut current, timed_out) =
            wait_while(&self.changed, guard, timeout, |c| !satisfied(*c));
        if timed_out {
            return Err(Error::from_timeout(timeout));
        }
        let before = *current;
        if !options.contains(FlagOptions::NO_CLEAR) {
            *current &= !flags;
        }
        Ok(before)
    }
}
