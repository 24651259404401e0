//! A remote node answering expedited SDO requests
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use rhs_common::sdo::AbortCode;
use rhs_common::{CanBus, CanFrame, NodeId};

/// Client command: initiate upload
pub const CCS_UPLOAD: u8 = 0x40;
/// Client command: expedited download, size given
pub const CCS_DOWNLOAD_EXPEDITED: u8 = 0x23;
/// Server command: download confirmed
pub const SCS_DOWNLOAD: u8 = 0x60;
/// Server command: expedited upload, size given
pub const SCS_UPLOAD_EXPEDITED: u8 = 0x43;
/// Abort transfer, in both directions
pub const CS_ABORT: u8 = 0x80;

/// Build an SDO frame with up to four data bytes
pub fn sdo_frame(cob_id: u16, command: u8, index: u16, sub: u8, data: &[u8]) -> CanFrame {
    assert!(data.len() <= 4);
    let mut payload = [0u8; 8];
    payload[0] = command;
    payload[1..3].copy_from_slice(&index.to_le_bytes());
    payload[3] = sub;
    payload[4..4 + data.len()].copy_from_slice(data);
    CanFrame::new_standard(cob_id, &payload)
}

/// Build an expedited SDO frame, encoding the data size into the command
pub fn expedited_frame(cob_id: u16, command: u8, index: u16, sub: u8, data: &[u8]) -> CanFrame {
    let size_bits = ((4 - data.len()) as u8) << 2;
    sdo_frame(cob_id, command | size_bits, index, sub, data)
}

/// Build an SDO abort frame
pub fn abort_frame(cob_id: u16, index: u16, sub: u8, code: u32) -> CanFrame {
    sdo_frame(cob_id, CS_ABORT, index, sub, &code.to_le_bytes())
}

/// Size of the data in an expedited frame with the size indicated
pub fn expedited_len(command: u8) -> usize {
    4 - ((command >> 2) & 0x3) as usize
}

/// The SDO server of a simulated remote node
///
/// Only expedited transfers are supported, so entries hold at most four bytes. Requests must be
/// full eight byte frames.
#[derive(Debug)]
pub struct SdoServer {
    node_id: NodeId,
    entries: Mutex<BTreeMap<(u16, u8), Vec<u8>>>,
    silent: AtomicBool,
    requests: AtomicUsize,
}

impl SdoServer {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            entries: Mutex::new(BTreeMap::new()),
            silent: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn set_entry(&self, index: u16, sub: u8, data: &[u8]) {
        assert!(data.len() <= 4);
        self.entries
            .lock()
            .unwrap()
            .insert((index, sub), data.to_vec());
    }

    pub fn entry(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(&(index, sub)).cloned()
    }

    /// Stop answering requests, as a node that fell off the bus would
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Number of requests addressed to this node
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Answer `frame`, if it is an SDO request for this node
    pub fn respond(&self, _bus: CanBus, frame: &CanFrame) -> Vec<CanFrame> {
        if frame.id != self.node_id.sdo_rx_cob_id() as u32 || frame.len < 8 {
            return Vec::new();
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.silent.load(Ordering::Relaxed) {
            return Vec::new();
        }

        let reply_id = self.node_id.sdo_tx_cob_id();
        let data = frame.data();
        let command = data[0];
        let index = u16::from_le_bytes([data[1], data[2]]);
        let sub = data[3];

        let reply = match command & 0xE0 {
            0x40 => match self.entry(index, sub) {
                Some(value) => expedited_frame(reply_id, SCS_UPLOAD_EXPEDITED, index, sub, &value),
                None => abort_frame(reply_id, index, sub, AbortCode::NoSuchObject as u32),
            },
            0x20 => {
                let len = expedited_len(command);
                match self.entries.lock().unwrap().get_mut(&(index, sub)) {
                    Some(entry) => {
                        *entry = data[4..4 + len].to_vec();
                        sdo_frame(reply_id, SCS_DOWNLOAD, index, sub, &[])
                    }
                    None => abort_frame(reply_id, index, sub, AbortCode::NoSuchObject as u32),
                }
            }
            _ => abort_frame(
                reply_id,
                index,
                sub,
                AbortCode::InvalidCommandSpecifier as u32,
            ),
        };
        vec![reply]
    }
}
