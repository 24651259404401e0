//! CAN frame and CANopen message types
//!
//! [`CanFrame`] is what the HAL moves on and off the wire. [`Message`] is the CANopen view of a
//! standard frame that the object dictionary stack consumes.

use crate::constants::cob;

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// The CAN peripherals available on the board
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanBus {
    /// First CAN controller
    Can1,
    /// Second CAN controller
    Can2,
}

impl CanBus {
    /// Zero based index of the controller
    pub const fn index(&self) -> usize {
        match self {
            CanBus::Can1 => 0,
            CanBus::Can2 => 1,
        }
    }
}

impl core::fmt::Display for CanBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.index() + 1)
    }
}

/// Identifier format of a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanFrameType {
    /// Frame slot is empty
    #[default]
    None,
    /// 11-bit identifier
    Standard,
    /// 29-bit identifier
    Extended,
}

/// A raw CAN frame as seen by the HAL
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    /// Identifier
    pub id: u32,
    /// Number of valid payload bytes
    pub len: u8,
    /// Identifier format
    pub frame_type: CanFrameType,
    /// Remote transmission request
    pub rtr: bool,
    /// Payload, only the first `len` bytes are meaningful
    pub payload: [u8; MAX_DATA_LENGTH],
}

impl CanFrame {
    /// Create a standard data frame
    ///
    /// Panics if data is longer than 8 bytes.
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        assert!(data.len() <= MAX_DATA_LENGTH);
        let mut payload = [0; MAX_DATA_LENGTH];
        payload[..data.len()].copy_from_slice(data);
        Self {
            id: id as u32,
            len: data.len() as u8,
            frame_type: CanFrameType::Standard,
            rtr: false,
            payload,
        }
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.payload[..(self.len as usize).min(MAX_DATA_LENGTH)]
    }
}

/// A CANopen message: a standard frame addressed by COB-ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The 11-bit communication object identifier
    pub cob_id: u16,
    /// Remote transmission request
    pub rtr: bool,
    /// Number of valid data bytes
    pub len: u8,
    /// Message data
    pub data: [u8; MAX_DATA_LENGTH],
}

impl Message {
    /// Create a new message
    ///
    /// Panics if data is longer than 8 bytes.
    pub fn new(cob_id: u16, data: &[u8]) -> Self {
        assert!(data.len() <= MAX_DATA_LENGTH);
        let mut buf = [0; MAX_DATA_LENGTH];
        buf[..data.len()].copy_from_slice(data);
        Self {
            cob_id,
            rtr: false,
            len: data.len() as u8,
            data: buf,
        }
    }

    /// Get the valid data bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..(self.len as usize).min(MAX_DATA_LENGTH)]
    }

    /// The function code part of the COB-ID
    pub fn function_code(&self) -> u16 {
        self.cob_id & cob::FUNCTION_MASK
    }

    /// The node ID part of the COB-ID
    pub fn node_id(&self) -> u8 {
        (self.cob_id & cob::NODE_ID_MASK) as u8
    }
}

/// Only the low 11 bits of the identifier are kept. Extended frames are not CANopen messages and
/// should be filtered out before converting.
impl From<CanFrame> for Message {
    fn from(frame: CanFrame) -> Self {
        let len = frame.len.min(MAX_DATA_LENGTH as u8);
        Self {
            cob_id: (frame.id & MAX_STANDARD_ID as u32) as u16,
            rtr: frame.rtr,
            len,
            data: frame.payload,
        }
    }
}

impl From<Message> for CanFrame {
    fn from(msg: Message) -> Self {
        Self {
            id: msg.cob_id as u32,
            len: msg.len,
            frame_type: CanFrameType::Standard,
            rtr: msg.rtr,
            payload: msg.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_message() {
        let mut frame = CanFrame::new_standard(0x581, &[0x43, 0x00, 0x10, 0x00, 1, 2, 3, 4]);
        frame.id |= 0x1000;
        let msg = Message::from(frame);
        assert_eq!(0x581, msg.cob_id);
        assert_eq!(0x580, msg.function_code());
        assert_eq!(1, msg.node_id());
        assert_eq!(&[0x43, 0x00, 0x10, 0x00, 1, 2, 3, 4], msg.data());
    }

    #[test]
    fn test_short_frame_data() {
        let frame = CanFrame::new_standard(0x123, &[0xAA, 0xBB]);
        assert_eq!(CanFrameType::Standard, frame.frame_type);
        assert_eq!(&[0xAA, 0xBB], frame.data());
        let msg: Message = frame.into();
        let back: CanFrame = msg.into();
        assert_eq!(frame, back);
    }
}
