//! The seam to the object dictionary stack
//!
//! The CAN-open protocol itself (SDO client lines, PDO mapping, NMT) is implemented by a stack
//! behind [`ObjectDictionary`]. The service feeds it received messages, asks it to start SDO
//! transfers and to send PDOs, and hands it a [`CanPort`] through which it transmits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rhs_common::{
    nmt::NmtState,
    sdo::{AbortCode, RawAbortCode, SdoTransfer, SDO_MAX_LENGTH_TRANSFER},
    CanBus, Message, NodeId,
};
use rhs_core::{event_flag::EventFlag, message_queue::MessageQueue};

/// Called once with the terminal state of an SDO client transfer
pub type SdoCompletion = Box<dyn FnOnce(&SdoTransfer) + Send>;

/// An object dictionary shared between the service thread and its users
pub type SharedOd = Arc<Mutex<dyn ObjectDictionary>>;

/// Service event: received frames are queued
pub(crate) const EVENT_RX: u32 = 1 << 0;
/// Service event: frames are queued for transmission
pub(crate) const EVENT_TX: u32 = 1 << 1;
/// Service event: PDOs should be sent
pub(crate) const EVENT_PDO: u32 = 1 << 2;
/// Service event: the set of stacks changed, alarms must be recomputed
pub(crate) const EVENT_TIMER: u32 = 1 << 3;
/// Service event: a controller went transmit passive
pub(crate) const EVENT_SCE: u32 = 1 << 4;

/// A message moving between the CAN interrupts, the service thread and the stack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanOpenAppMessage {
    /// Handler slot of the object dictionary the message belongs to
    pub slot: usize,
    /// Bus the message was received on, or is to be sent on
    pub bus: CanBus,
    /// The message
    pub message: Message,
}

/// Transmit handle given to an object dictionary when it is attached
///
/// Messages sent through the port are queued for the service thread, which hands them to the
/// controller.
#[derive(Clone)]
pub struct CanPort {
    slot: usize,
    bus: CanBus,
    tx_queue: Arc<MessageQueue<CanOpenAppMessage>>,
    srv_event: Arc<EventFlag>,
}

impl core::fmt::Debug for CanPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CanPort")
            .field("slot", &self.slot)
            .field("bus", &self.bus)
            .finish()
    }
}

impl CanPort {
    pub(crate) fn new(
        slot: usize,
        bus: CanBus,
        tx_queue: Arc<MessageQueue<CanOpenAppMessage>>,
        srv_event: Arc<EventFlag>,
    ) -> Self {
        Self {
            slot,
            bus,
            tx_queue,
            srv_event,
        }
    }

    /// Queue a message for transmission
    ///
    /// Never blocks. Fails with [`rhs_core::Error::ResourceUnavailable`] when the TX queue is full.
    pub fn send(&self, message: &Message) -> rhs_core::Result<()> {
        self.tx_queue.put(
            CanOpenAppMessage {
                slot: self.slot,
                bus: self.bus,
                message: *message,
            },
            0,
        )?;
        self.srv_event.set(EVENT_TX)?;
        Ok(())
    }

    /// The bus this port transmits on
    pub fn bus(&self) -> CanBus {
        self.bus
    }

    /// The handler slot this port belongs to
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// A CAN-open object dictionary and protocol stack
///
/// All methods are called with the dictionary locked. Completions passed to
/// [`read_network_dict`](ObjectDictionary::read_network_dict) and
/// [`write_network_dict`](ObjectDictionary::write_network_dict) are invoked from
/// [`dispatch`](ObjectDictionary::dispatch) once the remote node answers, after the stack has
/// closed the SDO line.
pub trait ObjectDictionary: Send {
    /// Give the stack its transmit port
    fn attach(&mut self, port: CanPort);

    /// Set the node ID of this dictionary
    fn set_node_id(&mut self, node_id: NodeId);

    /// Move the node to a new NMT state
    fn set_state(&mut self, state: NmtState);

    /// The current NMT state
    fn state(&self) -> NmtState;

    /// Process a received message
    fn dispatch(&mut self, message: &Message);

    /// Send all PDOs whose mapped values have changed
    fn send_pdo_event(&mut self);

    /// Run the stack's timers which are due at tick `now`
    ///
    /// Called by the service thread under the kernel lock after every wake up. Returns the number
    /// of milliseconds until the next alarm, or `None` when no alarm is set. Stacks without timers
    /// can keep the default.
    fn time_dispatch(&mut self, now: u32) -> Option<u32> {
        let _ = now;
        None
    }

    /// Start reading `index`/`sub` from `node_id`
    ///
    /// Returns the stack's error code if the transfer could not be started.
    fn read_network_dict(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        completion: SdoCompletion,
    ) -> Result<(), u8>;

    /// Start writing `data` to `index`/`sub` on `node_id`
    ///
    /// Returns the stack's error code if the transfer could not be started.
    fn write_network_dict(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        completion: SdoCompletion,
    ) -> Result<(), u8>;

    /// Abandon every SDO transfer in progress, dropping their completions
    fn reset_sdo(&mut self);

    /// Read a local entry into `buf`, returning the number of bytes read
    fn get_od_entry(&self, index: u16, sub: u8, buf: &mut [u8]) -> Result<usize, RawAbortCode>;

    /// Write a local entry
    fn set_od_entry(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), RawAbortCode>;
}

/// Lock a shared dictionary
///
/// A stack which panicked while locked is still handed out, the service keeps running.
pub fn lock_od(od: &SharedOd) -> MutexGuard<'_, dyn ObjectDictionary + 'static> {
    od.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A value which can be stored in an object dictionary entry
///
/// Values are stored little endian and occupy exactly [`OdValue::SIZE`] bytes.
pub trait OdValue: Copy + Send + 'static {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode from exactly `SIZE` bytes
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;

    /// Encode to `SIZE` bytes
    fn to_le_vec(&self) -> Vec<u8>;
}

macro_rules! impl_od_value {
    ($($t:ty),*) => {
        $(
            impl OdValue for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
                }

                fn to_le_vec(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_od_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32);

/// Read a typed value from a local entry
///
/// Fails with [`AbortCode::DataTypeMismatch`] if the entry is not `T::SIZE` bytes long.
pub fn od_get_field<T: OdValue>(od: &SharedOd, index: u16, sub: u8) -> Result<T, RawAbortCode> {
    let mut buf = [0u8; SDO_MAX_LENGTH_TRANSFER];
    let len = lock_od(od).get_od_entry(index, sub, &mut buf)?;
    buf.get(..len)
        .and_then(T::from_le_slice)
        .ok_or(RawAbortCode::Valid(AbortCode::DataTypeMismatch))
}
