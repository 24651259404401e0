//! A small object dictionary stack for driving the CAN-open service
//!
//! [`MockOd`] implements just enough of CANopen for the service to be exercised end to end:
//! expedited SDO client transfers, NMT commands, a boot-up message, a heartbeat producer and a
//! single TPDO.
use std::collections::BTreeMap;

use rhs_can_open::{CanPort, ObjectDictionary, SdoCompletion};
use rhs_common::constants::{cob, fields};
use rhs_common::nmt::NmtState;
use rhs_common::sdo::{AbortCode, RawAbortCode, SdoTransfer, TransferState};
use rhs_common::{Message, NodeId};
use rhs_core::kernel;

use crate::sdo_server::{
    expedited_frame, expedited_len, sdo_frame, CCS_DOWNLOAD_EXPEDITED, CCS_UPLOAD, CS_ABORT,
    SCS_DOWNLOAD,
};

/// Entry mapped into TPDO1
pub const PDO_SOURCE: (u16, u8) = (0x2000, 0);

/// Error returned when a transfer is requested while another one is in progress
pub const ERR_LINE_BUSY: u8 = 1;
/// Error returned when no port is attached
pub const ERR_NO_PORT: u8 = 2;
/// Error returned when the request could not be queued
pub const ERR_SEND: u8 = 3;
/// Error returned when data does not fit an expedited transfer
pub const ERR_TOO_LONG: u8 = 4;

/// What happened on the SDO line, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoEvent {
    Started { index: u16 },
    Completed { index: u16 },
    Reset,
}

struct PendingSdo {
    node_id: u8,
    index: u16,
    sub: u8,
    completion: SdoCompletion,
}

/// A received message, and the kernel lock depth it was dispatched with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatched {
    pub message: Message,
    pub lock_depth: u32,
}

#[derive(Default)]
pub struct MockOd {
    node_id: Option<NodeId>,
    state: Option<NmtState>,
    port: Option<CanPort>,
    entries: BTreeMap<(u16, u8), Vec<u8>>,
    pending: Option<PendingSdo>,
    sdo_events: Vec<SdoEvent>,
    dispatched: Vec<Dispatched>,
    pdo_events: usize,
    next_heartbeat: Option<u32>,
}

impl MockOd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn port(&self) -> Option<&CanPort> {
        self.port.as_ref()
    }

    pub fn entry(&self, index: u16, sub: u8) -> Option<&[u8]> {
        self.entries.get(&(index, sub)).map(Vec::as_slice)
    }

    pub fn sdo_events(&self) -> &[SdoEvent] {
        &self.sdo_events
    }

    pub fn dispatched(&self) -> &[Dispatched] {
        &self.dispatched
    }

    pub fn pdo_events(&self) -> usize {
        self.pdo_events
    }

    pub fn sdo_in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Producer heartbeat period in ms, zero when disabled
    fn heartbeat_period(&self) -> u32 {
        let field = fields::PRODUCER_HEARTBEAT;
        self.entries
            .get(&(field.index, field.sub))
            .and_then(|v| Some(u16::from_le_bytes(v.as_slice().try_into().ok()?)))
            .map_or(0, u32::from)
    }

    fn send(&self, message: Message) -> bool {
        match &self.port {
            Some(port) => port.send(&message).is_ok(),
            None => false,
        }
    }

    fn start_sdo(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        request: Message,
        completion: SdoCompletion,
    ) -> Result<(), u8> {
        if self.pending.is_some() {
            return Err(ERR_LINE_BUSY);
        }
        if self.port.is_none() {
            return Err(ERR_NO_PORT);
        }
        if !self.send(request) {
            return Err(ERR_SEND);
        }
        self.sdo_events.push(SdoEvent::Started { index });
        self.pending = Some(PendingSdo {
            node_id,
            index,
            sub,
            completion,
        });
        Ok(())
    }

    fn handle_sdo_response(&mut self, message: &Message) {
        let data = message.data();
        let expected = self
            .pending
            .as_ref()
            .is_some_and(|p| message.cob_id == cob::SDO_TX + p.node_id as u16);
        if !expected || data.len() < 8 {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        let command = data[0];
        let transfer = match command & 0xE0 {
            0x40 => {
                let len = expedited_len(command);
                SdoTransfer::finished(
                    pending.node_id,
                    pending.index,
                    pending.sub,
                    &data[4..4 + len],
                )
            }
            SCS_DOWNLOAD => SdoTransfer::finished(pending.node_id, pending.index, pending.sub, &[]),
            CS_ABORT => SdoTransfer::aborted(
                pending.node_id,
                pending.index,
                pending.sub,
                TransferState::AbortedRcv,
                u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            ),
            _ => SdoTransfer::aborted(
                pending.node_id,
                pending.index,
                pending.sub,
                TransferState::AbortedInternal,
                AbortCode::InvalidCommandSpecifier as u32,
            ),
        };
        self.sdo_events.push(SdoEvent::Completed {
            index: pending.index,
        });
        (pending.completion)(&transfer);
    }

    fn handle_nmt(&mut self, message: &Message) {
        let data = message.data();
        if data.len() < 2 {
            return;
        }
        let addressed = data[1] == 0 || Some(data[1]) == self.node_id.map(|id| id.raw());
        if !addressed {
            return;
        }
        let state = match data[0] {
            0x01 => NmtState::Operational,
            0x02 => NmtState::Stopped,
            0x80 => NmtState::PreOperational,
            _ => return,
        };
        self.state = Some(state);
    }
}

impl ObjectDictionary for MockOd {
    fn attach(&mut self, port: CanPort) {
        self.port = Some(port);
    }

    fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    fn set_state(&mut self, state: NmtState) {
        self.state = Some(state);
        if state == NmtState::Initialisation {
            if let Some(id) = self.node_id {
                self.send(Message::new(cob::HEARTBEAT + id.raw() as u16, &[0]));
            }
            self.state = Some(NmtState::PreOperational);
        }
    }

    fn state(&self) -> NmtState {
        self.state.unwrap_or(NmtState::Unknown)
    }

    fn dispatch(&mut self, message: &Message) {
        self.dispatched.push(Dispatched {
            message: *message,
            lock_depth: kernel::lock_depth(),
        });
        match message.function_code() {
            cob::NMT => self.handle_nmt(message),
            cob::SDO_TX => self.handle_sdo_response(message),
            _ => (),
        }
    }

    fn send_pdo_event(&mut self) {
        self.pdo_events += 1;
        if self.state != Some(NmtState::Operational) {
            return;
        }
        let (Some(id), Some(value)) = (self.node_id, self.entries.get(&PDO_SOURCE)) else {
            return;
        };
        let len = value.len().min(8);
        let message = Message::new(cob::TPDO1 + id.raw() as u16, &value[..len]);
        self.send(message);
    }

    fn time_dispatch(&mut self, now: u32) -> Option<u32> {
        let period = self.heartbeat_period();
        let id = self.node_id?;
        if period == 0 {
            self.next_heartbeat = None;
            return None;
        }
        let due = *self.next_heartbeat.get_or_insert(now);
        let remaining = due.wrapping_sub(now) as i32;
        if remaining > 0 {
            return Some(remaining as u32);
        }
        self.send(Message::new(cob::HEARTBEAT + id.raw() as u16, &[self.state() as u8]));
        self.next_heartbeat = Some(now.wrapping_add(period));
        Some(period)
    }

    fn read_network_dict(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        completion: SdoCompletion,
    ) -> Result<(), u8> {
        let request = sdo_frame(cob::SDO_RX + node_id as u16, CCS_UPLOAD, index, sub, &[]);
        self.start_sdo(node_id, index, sub, request.into(), completion)
    }

    fn write_network_dict(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        completion: SdoCompletion,
    ) -> Result<(), u8> {
        if data.len() > 4 {
            return Err(ERR_TOO_LONG);
        }
        let request = expedited_frame(
            cob::SDO_RX + node_id as u16,
            CCS_DOWNLOAD_EXPEDITED,
            index,
            sub,
            data,
        );
        self.start_sdo(node_id, index, sub, request.into(), completion)
    }

    fn reset_sdo(&mut self) {
        if self.pending.take().is_some() {
            self.sdo_events.push(SdoEvent::Reset);
        }
    }

    fn get_od_entry(&self, index: u16, sub: u8, buf: &mut [u8]) -> Result<usize, RawAbortCode> {
        let value = self
            .entries
            .get(&(index, sub))
            .ok_or(RawAbortCode::Valid(AbortCode::NoSuchObject))?;
        if value.len() > buf.len() {
            return Err(RawAbortCode::Valid(AbortCode::DataTypeMismatchLengthHigh));
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn set_od_entry(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), RawAbortCode> {
        self.entries.insert((index, sub), data.to_vec());
        Ok(())
    }
}
