//! Node ID newtype
//!

use snafu::Snafu;

/// The ID of a CANopen node on the bus, always in 1..=127
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(u8);

/// Error for converting a u8 to a NodeId
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Invalid node ID {value}"))]
pub struct InvalidNodeIdError {
    /// The rejected value
    pub value: u8,
}

impl NodeId {
    /// Try to create a new NodeId
    ///
    /// It will fail if value is invalid (i.e. <1 or >127)
    pub const fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value > 0 && value < 128 {
            Ok(NodeId(value))
        } else {
            Err(InvalidNodeIdError { value })
        }
    }

    /// Get the raw node ID as a u8
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// COB-ID this node answers SDO requests on
    pub const fn sdo_tx_cob_id(&self) -> u16 {
        crate::constants::cob::SDO_TX + self.0 as u16
    }

    /// COB-ID this node receives SDO requests on
    pub const fn sdo_rx_cob_id(&self) -> u16 {
        crate::constants::cob::SDO_RX + self.0 as u16
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}
