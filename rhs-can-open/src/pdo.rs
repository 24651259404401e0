//! PDO configuration of remote nodes
//!
//! Each helper is a single SDO write to the PDO communication or mapping parameters of node
//! `node_id`. PDO numbers are zero based; PDO `n` lives at the base index plus `n`.

use rhs_common::{
    constants::{fields, OdField},
    pdo::{PdoField, PdoKind, PdoMapping, MAX_PDO_MAPPINGS, NUM_PDOS},
    sdo::RawAbortCode,
};
use rhs_core::{rhs_assert, rhs_crash};

use crate::app::CanOpenApp;
use crate::object_dict::SharedOd;
use crate::sdo::SdoError;

impl CanOpenApp {
    fn write_sdo_field(
        &self,
        od: &SharedOd,
        node_id: u8,
        field: OdField,
        value: u32,
    ) -> Result<(), SdoError> {
        let size = field.size as usize;
        rhs_assert!(size <= 4, "Field 0x{:04X} is too large", field.index);
        let bytes = value.to_le_bytes();
        self.write_sdo(od, node_id, field.index, field.sub, &bytes[..size], |_| {})
            .map(|_| ())
    }

    fn pdo_config(
        &self,
        od: &SharedOd,
        kind: PdoKind,
        node_id: u8,
        npdo: u8,
        field: PdoField,
        value: u32,
    ) -> Result<(), SdoError> {
        rhs_assert!(npdo < NUM_PDOS);
        if field == PdoField::Config {
            rhs_crash!("You cannot set group field in PDO");
        }
        self.write_sdo_field(od, node_id, field.field(kind, npdo), value)
    }

    /// Write one communication parameter of RPDO `npdo`
    ///
    /// [`PdoField::Config`] is the entry count of the record and cannot be written; asking for it
    /// crashes.
    pub fn rpdo_config(
        &self,
        od: &SharedOd,
        node_id: u8,
        npdo: u8,
        field: PdoField,
        value: u32,
    ) -> Result<(), SdoError> {
        self.pdo_config(od, PdoKind::Receive, node_id, npdo, field, value)
    }

    /// Write one communication parameter of TPDO `npdo`
    pub fn tpdo_config(
        &self,
        od: &SharedOd,
        node_id: u8,
        npdo: u8,
        field: PdoField,
        value: u32,
    ) -> Result<(), SdoError> {
        self.pdo_config(od, PdoKind::Transmit, node_id, npdo, field, value)
    }

    fn pdo_map(
        &self,
        od: &SharedOd,
        kind: PdoKind,
        node_id: u8,
        npdo: u8,
        nmap: u8,
        mapping: PdoMapping,
    ) -> Result<(), SdoError> {
        rhs_assert!(npdo < NUM_PDOS);
        rhs_assert!(0 < nmap && nmap <= MAX_PDO_MAPPINGS);
        self.write_sdo_field(
            od,
            node_id,
            kind.map_field(npdo, nmap),
            mapping.to_object_value(),
        )
    }

    /// Write mapping slot `nmap` (1..=8) of RPDO `npdo`
    pub fn rpdo_map(
        &self,
        od: &SharedOd,
        node_id: u8,
        npdo: u8,
        nmap: u8,
        mapping: PdoMapping,
    ) -> Result<(), SdoError> {
        self.pdo_map(od, PdoKind::Receive, node_id, npdo, nmap, mapping)
    }

    /// Write mapping slot `nmap` (1..=8) of TPDO `npdo`
    pub fn tpdo_map(
        &self,
        od: &SharedOd,
        node_id: u8,
        npdo: u8,
        nmap: u8,
        mapping: PdoMapping,
    ) -> Result<(), SdoError> {
        self.pdo_map(od, PdoKind::Transmit, node_id, npdo, nmap, mapping)
    }

    fn pdo_map_group(
        &self,
        od: &SharedOd,
        kind: PdoKind,
        node_id: u8,
        npdo: u8,
        count: u8,
    ) -> Result<(), SdoError> {
        rhs_assert!(npdo < NUM_PDOS);
        rhs_assert!(count <= MAX_PDO_MAPPINGS);
        self.write_sdo_field(od, node_id, kind.map_count_field(npdo), count as u32)
    }

    /// Set the number of mapped entries of RPDO `npdo`
    pub fn rpdo_map_group(
        &self,
        od: &SharedOd,
        node_id: u8,
        npdo: u8,
        count: u8,
    ) -> Result<(), SdoError> {
        self.pdo_map_group(od, PdoKind::Receive, node_id, npdo, count)
    }

    /// Set the number of mapped entries of TPDO `npdo`
    pub fn tpdo_map_group(
        &self,
        od: &SharedOd,
        node_id: u8,
        npdo: u8,
        count: u8,
    ) -> Result<(), SdoError> {
        self.pdo_map_group(od, PdoKind::Transmit, node_id, npdo, count)
    }

    /// Point the local SDO client at the server on `node_id`
    pub fn set_sdo_communication(&self, od: &SharedOd, node_id: u8) -> Result<(), RawAbortCode> {
        let id = node_id as u32;
        self.set_field_value(od, fields::SDO_STX.index, fields::SDO_STX.sub, 0x600 + id)?;
        self.set_field_value(od, fields::SDO_SRX.index, fields::SDO_SRX.sub, 0x580 + id)?;
        self.set_field_value(
            od,
            fields::SDO_SERVER_ID.index,
            fields::SDO_SERVER_ID.sub,
            id,
        )
    }

    /// Clear the local SDO client parameters
    pub fn reset_sdo_communication(&self, od: &SharedOd) -> Result<(), RawAbortCode> {
        self.set_field_value(od, fields::SDO_STX.index, fields::SDO_STX.sub, 0u32)?;
        self.set_field_value(od, fields::SDO_SRX.index, fields::SDO_SRX.sub, 0u32)?;
        self.set_field_value(
            od,
            fields::SDO_SERVER_ID.index,
            fields::SDO_SERVER_ID.sub,
            0u32,
        )
    }
}
