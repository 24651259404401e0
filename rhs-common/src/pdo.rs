//! Definitions and data types related to PDOs

use crate::constants::{object_ids, OdField};

/// Number of PDOs of each direction which can be configured through the helpers
pub const NUM_PDOS: u8 = 4;
/// Number of mapping slots in one PDO mapping object
pub const MAX_PDO_MAPPINGS: u8 = 8;

/// Represents a PDO mapping
///
/// Each mapping specifies one sub-object to be included in the PDO data bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the object to map, in **bytes**
    pub size: u8,
}

impl PdoMapping {
    /// Convert a PdoMapping object to the u32 representation stored in the mapping object
    ///
    /// The stored length is in bits, so the byte size is shifted up by 3.
    pub fn to_object_value(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | ((self.size as u32) << 3)
    }

    /// Create a PdoMapping object from the raw u32 representation stored in the mapping object
    pub fn from_object_value(value: u32) -> Self {
        let index = (value >> 16) as u16;
        let sub = ((value >> 8) & 0xff) as u8;
        let size = ((value & 0xff) >> 3) as u8;
        Self { index, sub, size }
    }
}

/// Direction of a PDO, as seen by the node being configured
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoKind {
    /// Receive PDO (0x1400 / 0x1600)
    Receive,
    /// Transmit PDO (0x1800 / 0x1A00)
    Transmit,
}

impl PdoKind {
    /// Index of the communication parameter object of PDO 0
    pub const fn comm_base(&self) -> u16 {
        match self {
            PdoKind::Receive => object_ids::RPDO_COMM_BASE,
            PdoKind::Transmit => object_ids::TPDO_COMM_BASE,
        }
    }

    /// Index of the mapping object of PDO 0
    pub const fn map_base(&self) -> u16 {
        match self {
            PdoKind::Receive => object_ids::RPDO_MAP_BASE,
            PdoKind::Transmit => object_ids::TPDO_MAP_BASE,
        }
    }

    /// Field holding the number of mapped entries of PDO `npdo`
    pub const fn map_count_field(&self, npdo: u8) -> OdField {
        OdField::new(self.map_base() + npdo as u16, 0, 1)
    }

    /// Field holding mapping slot `nmap` (1..=8) of PDO `npdo`
    pub const fn map_field(&self, npdo: u8, nmap: u8) -> OdField {
        OdField::new(self.map_base() + npdo as u16, nmap, 4)
    }
}

/// Fields of a PDO communication parameter object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoField {
    /// Number of entries (sub 0). Not writable as a single field.
    Config,
    /// COB-ID used by the PDO
    Id,
    /// Transmission type
    Type,
    /// Inhibit time
    Inhibit,
    /// Reserved
    Reserved,
    /// Event timer
    EventTime,
}

impl PdoField {
    /// Field descriptor for this field of PDO `npdo`
    pub const fn field(&self, kind: PdoKind, npdo: u8) -> OdField {
        let (sub, size) = match self {
            PdoField::Config => (0, 1),
            PdoField::Id => (1, 4),
            PdoField::Type => (2, 1),
            PdoField::Inhibit => (3, 2),
            PdoField::Reserved => (4, 1),
            PdoField::EventTime => (5, 2),
        };
        OdField::new(kind.comm_base(), sub, size).offset(npdo)
    }
}
