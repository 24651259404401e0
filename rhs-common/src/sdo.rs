//! SDO transfer records and abort codes
//!
//! An [`SdoTransfer`] is the terminal state of one client transfer, handed by the object
//! dictionary stack to the completion callback.

use int_enum::IntEnum;

/// Largest payload carried by a single SDO transfer
pub const SDO_MAX_LENGTH_TRANSFER: usize = 32;

/// SDO abort codes, as defined by CiA 301
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnmappablePdo = 0x0604_0041,
    /// Number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low
    ValueTooLow = 0x0609_0032,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be stored because of the present device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to receive other values
/// and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "{code:X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

impl From<RawAbortCode> for u32 {
    fn from(value: RawAbortCode) -> Self {
        match value {
            RawAbortCode::Valid(code) => code.into(),
            RawAbortCode::Unknown(code) => code,
        }
    }
}

/// State of an SDO transfer line
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferState {
    /// Line is free
    Reset = 0x00,
    /// Transfer completed successfully
    Finished = 0x01,
    /// Download (write) in progress
    DownloadInProgress = 0x02,
    /// Upload (read) in progress
    UploadInProgress = 0x03,
    /// Block download in progress
    BlockDownloadInProgress = 0x04,
    /// Block upload in progress
    BlockUploadInProgress = 0x05,
    /// The remote node aborted the transfer
    AbortedRcv = 0x80,
    /// The transfer was aborted locally
    AbortedInternal = 0x85,
}

impl TransferState {
    /// Returns true for both abort states
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransferState::AbortedRcv | TransferState::AbortedInternal)
    }
}

/// The result of an SDO client transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdoTransfer {
    /// Node ID of the server
    pub node_id: u8,
    /// Final state of the line
    pub state: TransferState,
    /// Object index
    pub index: u16,
    /// Object sub index
    pub sub_index: u8,
    /// Number of valid bytes in `data`
    pub count: usize,
    /// Transferred data
    pub data: [u8; SDO_MAX_LENGTH_TRANSFER],
    /// Abort code, zero unless the transfer was aborted
    pub abort_code: u32,
}

impl SdoTransfer {
    /// Create a finished transfer carrying `data`
    ///
    /// Data beyond [`SDO_MAX_LENGTH_TRANSFER`] is dropped.
    pub fn finished(node_id: u8, index: u16, sub_index: u8, data: &[u8]) -> Self {
        let count = data.len().min(SDO_MAX_LENGTH_TRANSFER);
        let mut buf = [0; SDO_MAX_LENGTH_TRANSFER];
        buf[..count].copy_from_slice(&data[..count]);
        Self {
            node_id,
            state: TransferState::Finished,
            index,
            sub_index,
            count,
            data: buf,
            abort_code: 0,
        }
    }

    /// Create an aborted transfer
    pub fn aborted(
        node_id: u8,
        index: u16,
        sub_index: u8,
        state: TransferState,
        abort_code: u32,
    ) -> Self {
        Self {
            node_id,
            state,
            index,
            sub_index,
            count: 0,
            data: [0; SDO_MAX_LENGTH_TRANSFER],
            abort_code,
        }
    }

    /// Get the valid transferred bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.count.min(SDO_MAX_LENGTH_TRANSFER)]
    }

    /// Get the abort code as a [`RawAbortCode`]
    pub fn raw_abort_code(&self) -> RawAbortCode {
        self.abort_code.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_abort_code() {
        assert_eq!(
            RawAbortCode::Valid(AbortCode::NoSuchObject),
            RawAbortCode::from(0x0602_0000)
        );
        assert_eq!(RawAbortCode::Unknown(0x1234), RawAbortCode::from(0x1234));
        assert_eq!(0x0800_0000u32, RawAbortCode::Valid(AbortCode::GeneralError).into());
    }

    #[test]
    fn test_transfer_data() {
        let t = SdoTransfer::finished(3, 0x2000, 1, &[1, 2, 3]);
        assert_eq!(&[1, 2, 3], t.data());
        assert!(!t.state.is_aborted());

        let t = SdoTransfer::aborted(3, 0x2000, 1, TransferState::AbortedRcv, 0x0602_0000);
        assert!(t.data().is_empty());
        assert!(t.state.is_aborted());
        assert_eq!(RawAbortCode::Valid(AbortCode::NoSuchObject), t.raw_abort_code());
    }
}
