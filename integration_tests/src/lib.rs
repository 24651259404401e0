pub mod mock_od;
pub mod sdo_server;
pub mod sim_bus;
pub mod utils;

pub mod prelude {
    pub use super::mock_od::{Dispatched, MockOd, SdoEvent, PDO_SOURCE};
    pub use super::sdo_server::SdoServer;
    pub use super::sim_bus::SimCanHal;
    pub use super::utils::{init_logging, wait_until, TestBench, BAUD, LOCAL_NODE, REMOTE_NODE};
    pub use rhs_can_open::{CanOpenApp, CanOpenConfig, ObjectDictionary, SdoError, SharedOd};
    pub use rhs_common::{sdo::AbortCode, CanBus, CanFrame, NodeId};
}
