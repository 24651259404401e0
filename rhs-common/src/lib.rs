//! Common types shared by the RHS core and the CAN-open service.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `rhs-can-open`.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]

pub mod constants;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod pdo;
pub mod sdo;
pub mod traits;

pub use messages::{CanBus, CanFrame, CanFrameType, Message};
pub use node_id::NodeId;
