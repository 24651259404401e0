//! Constants defining standard objects, COB-ID function codes and field descriptors
//!
//!

/// Describes a single sub-object of the object dictionary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OdField {
    /// The object index
    pub index: u16,
    /// The sub index
    pub sub: u8,
    /// The size of the sub-object in bytes
    pub size: u8,
}

impl OdField {
    /// Create a new field descriptor
    pub const fn new(index: u16, sub: u8, size: u8) -> Self {
        Self { index, sub, size }
    }

    /// Get the same field on an object `offset` places after this one
    ///
    /// Used for the PDO parameter tables, where PDO N lives at `base + N`.
    pub const fn offset(&self, offset: u8) -> Self {
        Self {
            index: self.index + offset as u16,
            sub: self.sub,
            size: self.size,
        }
    }
}

/// Object indices for standard objects
pub mod object_ids {
    /// The Device Type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// The SDO client parameter object index
    pub const SDO_CLIENT: u16 = 0x1280;

    /// The first RPDO communication parameter index. RPDO comm can be stored from 0x1400 to 0x15FF.
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    ///  The first RPDO mapping parameter index. RPDO mappings can be stored from 0x1600 to 0x17FF;
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// The first TPDO communication parameter index. TPDO comms can be stored from 0x1800 to 0x19FF.
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    ///  The first TPDO mapping parameter index. TPDO mappings can be stored from 0x1A00 to 0x1BFF;
    pub const TPDO_MAP_BASE: u16 = 0x1A00;
}

/// Field descriptors for the standard objects used by the service
pub mod fields {
    use super::{object_ids as ids, OdField};

    /// Device type (0x1000)
    pub const DEVICE_TYPE: OdField = OdField::new(ids::DEVICE_TYPE, 0, 4);
    /// Device name (0x1008)
    pub const DEVICE_NAME: OdField = OdField::new(ids::DEVICE_NAME, 0, 32);
    /// Heartbeat producer time (0x1017)
    pub const PRODUCER_HEARTBEAT: OdField = OdField::new(ids::HEARTBEAT_PRODUCER_TIME, 0, 2);
    /// Identity: vendor ID
    pub const DEVICE_VENDOR: OdField = OdField::new(ids::IDENTITY, 1, 4);
    /// Identity: product code
    pub const DEVICE_CODE: OdField = OdField::new(ids::IDENTITY, 2, 4);
    /// Identity: revision number
    pub const DEVICE_REVISION: OdField = OdField::new(ids::IDENTITY, 3, 4);
    /// Identity: serial number
    pub const DEVICE_SERIAL: OdField = OdField::new(ids::IDENTITY, 4, 4);

    /// SDO client parameter: COB-ID client to server
    pub const SDO_STX: OdField = OdField::new(ids::SDO_CLIENT, 1, 4);
    /// SDO client parameter: COB-ID server to client
    pub const SDO_SRX: OdField = OdField::new(ids::SDO_CLIENT, 2, 4);
    /// SDO client parameter: node ID of the server
    pub const SDO_SERVER_ID: OdField = OdField::new(ids::SDO_CLIENT, 3, 4);
}

/// CANopen function codes, which form the upper bits of the COB-ID
pub mod cob {
    /// NMT command
    pub const NMT: u16 = 0x000;
    /// SYNC
    pub const SYNC: u16 = 0x080;
    /// First TPDO function code
    pub const TPDO1: u16 = 0x180;
    /// First RPDO function code
    pub const RPDO1: u16 = 0x200;
    /// SDO server to client (response)
    pub const SDO_TX: u16 = 0x580;
    /// SDO client to server (request)
    pub const SDO_RX: u16 = 0x600;
    /// Heartbeat / node guarding
    pub const HEARTBEAT: u16 = 0x700;

    /// Mask selecting the node ID bits of a COB-ID
    pub const NODE_ID_MASK: u16 = 0x07F;
    /// Mask selecting the function code bits of a COB-ID
    pub const FUNCTION_MASK: u16 = 0x780;
}
