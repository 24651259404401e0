//! NMT state of a local node

/// NMT state of a node, as the object dictionary stack reports it
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Node is initialising
    ///
    /// Entered by `start_node`; the stack moves on to PreOperational by itself
    Initialisation = 0x00,
    /// Node is not connected to the network
    Disconnected = 0x01,
    /// Node is connecting
    Connecting = 0x02,
    /// Node has been stopped
    Stopped = 0x04,
    /// Normal operational state
    Operational = 0x05,
    /// Node is awaiting command to enter operation
    PreOperational = 0x7F,
    /// State not known
    Unknown = 0x0F,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initialisation => write!(f, "Initialisation"),
            NmtState::Disconnected => write!(f, "Disconnected"),
            NmtState::Connecting => write!(f, "Connecting"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
            NmtState::Unknown => write!(f, "Unknown"),
        }
    }
}
