#![allow(dead_code)]
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhs_can_open::{CanOpenApp, CanOpenConfig, SharedOd};
use rhs_common::{CanBus, NodeId};

use crate::mock_od::MockOd;
use crate::sdo_server::SdoServer;
use crate::sim_bus::SimCanHal;

/// Node ID of the local node in most tests
pub const LOCAL_NODE: u8 = 1;
/// Node ID of the simulated remote node
pub const REMOTE_NODE: u8 = 5;
pub const BAUD: u32 = 500_000;

/// Route log output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// A running CAN-open service with one local node on CAN1 and a remote SDO server behind it
pub struct TestBench {
    pub hal: Arc<SimCanHal>,
    pub app: Arc<CanOpenApp>,
    pub od: Arc<Mutex<MockOd>>,
    pub remote: Arc<SdoServer>,
}

impl TestBench {
    pub fn new(config: CanOpenConfig) -> Self {
        init_logging();
        let hal = SimCanHal::new();
        let remote = Arc::new(SdoServer::new(NodeId::new(REMOTE_NODE).unwrap()));
        {
            let remote = remote.clone();
            hal.set_responder(move |bus, frame| remote.respond(bus, frame));
        }
        let app = CanOpenApp::start(hal.clone(), config);
        let od = Arc::new(Mutex::new(MockOd::new()));
        app.start_node(
            od.clone(),
            NodeId::new(LOCAL_NODE).unwrap(),
            CanBus::Can1,
            BAUD,
        )
        .unwrap();
        Self {
            hal,
            app,
            od,
            remote,
        }
    }

    /// The local dictionary as the service sees it
    pub fn shared_od(&self) -> SharedOd {
        self.od.clone()
    }

    /// Lock the local dictionary for inspection
    pub fn od(&self) -> std::sync::MutexGuard<'_, MockOd> {
        self.od.lock().unwrap()
    }
}
