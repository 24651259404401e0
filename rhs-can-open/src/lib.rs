//! CAN-open service for the RHS board support layer
//!
//! The service connects the CAN controllers, through [`CanHal`], to up to [`MAX_OD`] object
//! dictionary stacks implementing [`ObjectDictionary`]:
//!
//! * The receive interrupt queues frames; the service thread dispatches them into the stack while
//!   holding the kernel lock.
//! * Frames sent by a stack through its [`CanPort`] are queued and transmitted by the service
//!   thread, with a bounded number of retries.
//! * SDO reads and writes on remote nodes are serialized, one transaction at a time, and bounded
//!   by a timeout. See [`CanOpenApp::read_sdo`].
//! * Writing a local entry with [`CanOpenApp::set_field`] schedules a PDO event on every stack.
//!
//! At boot, [`can_open_service`] starts the service, hooks the `can_open` command into the CLI,
//! and publishes the app as the [`RECORD_CAN_OPEN`] record.
#![warn(missing_docs, missing_debug_implementations)]

use std::sync::Arc;

use defmt_or_log::error;
use rhs_common::traits::CanHal;
use rhs_core::{
    cli::{CliHandle, RECORD_CLI},
    record,
};

mod app;
pub mod cli;
pub mod config;
mod filter;
mod object_dict;
mod pdo;
mod sdo;

pub use app::{CanOpenApp, CanOpenError, MAX_OD};
pub use config::CanOpenConfig;
pub use filter::FilterList;
pub use object_dict::{
    lock_od, od_get_field, CanOpenAppMessage, CanPort, ObjectDictionary, OdValue, SdoCompletion,
    SharedOd,
};
pub use sdo::SdoError;

pub use rhs_common as common;

/// Name of the CAN-open record
pub const RECORD_CAN_OPEN: &str = "can_open";

/// Start the CAN-open service and publish it
///
/// Blocks until the CLI service has published itself, then registers the `can_open` command and
/// publishes the app as [`RECORD_CAN_OPEN`].
pub fn can_open_service(hal: Arc<dyn CanHal>, config: CanOpenConfig) -> Arc<CanOpenApp> {
    let app = CanOpenApp::start(hal, config);

    let handle = record::open::<CliHandle>(RECORD_CLI);
    if let Err(e) = app.register_command(handle.cli()) {
        error!("Failed to register the {} command: {}", cli::COMMAND_NAME, e);
    }
    record::close(RECORD_CLI);

    record::create(RECORD_CAN_OPEN, app.clone());
    app
}
