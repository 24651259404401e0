//! Common traits
//!
//! [`CanHal`] is the seam to the register level CAN driver. Callbacks registered through it are
//! invoked from interrupt context.

use crate::messages::{CanBus, CanFrame};

/// Status change conditions reported by the status change (SCE) interrupt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SceEvent(pub u8);

impl SceEvent {
    /// Transmit error counter passed the error passive limit
    pub const TX_PASSIVE: SceEvent = SceEvent(1 << 0);
    /// Receive error counter passed the error passive limit
    pub const RX_PASSIVE: SceEvent = SceEvent(1 << 1);
    /// Controller entered bus-off
    pub const BUS_OFF: SceEvent = SceEvent(1 << 2);
    /// Any other error condition
    pub const ERROR: SceEvent = SceEvent(1 << 3);

    /// Returns true if all bits of `other` are set
    pub const fn contains(&self, other: SceEvent) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for SceEvent {
    type Output = SceEvent;

    fn bitor(self, rhs: Self) -> Self::Output {
        SceEvent(self.0 | rhs.0)
    }
}

/// Callback invoked from the receive interrupt when a frame is pending
#[cfg(feature = "std")]
pub type CanRxCallback = std::sync::Arc<dyn Fn(CanBus) + Send + Sync>;

/// Callback invoked from the transmit interrupt when a mailbox has been sent
#[cfg(feature = "std")]
pub type CanTxCallback = std::sync::Arc<dyn Fn(CanBus) + Send + Sync>;

/// Callback invoked from the status change interrupt
#[cfg(feature = "std")]
pub type CanSceCallback = std::sync::Arc<dyn Fn(CanBus, SceEvent) + Send + Sync>;

/// Register level access to the CAN controllers
#[cfg(feature = "std")]
pub trait CanHal: Send + Sync {
    /// Bring up the controller at `baud` bits per second
    fn init(&self, bus: CanBus, baud: u32);

    /// Shut the controller down
    fn deinit(&self, bus: CanBus);

    /// Attempt to queue a frame for transmission
    ///
    /// Returns false if no transmit mailbox was free.
    fn tx(&self, bus: CanBus, frame: &CanFrame) -> bool;

    /// Read the next pending frame, if any
    fn rx(&self, bus: CanBus) -> Option<CanFrame>;

    /// Install the receive interrupt callback
    fn async_rx_start(&self, bus: CanBus, callback: CanRxCallback);

    /// Install the transmit complete interrupt callback
    fn async_tx_complete(&self, bus: CanBus, callback: CanTxCallback);

    /// Install the status change interrupt callback
    fn async_sce(&self, bus: CanBus, callback: CanSceCallback);
}
