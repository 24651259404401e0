use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rhs_common::traits::{CanHal, CanRxCallback, CanSceCallback, CanTxCallback, SceEvent};
use rhs_common::{CanBus, CanFrame};
use rhs_core::kernel;

/// Computes the frames other nodes on the bus answer a transmitted frame with
pub type Responder = Arc<dyn Fn(CanBus, &CanFrame) -> Vec<CanFrame> + Send + Sync>;

#[derive(Default)]
struct BusState {
    baud: Option<u32>,
    deinit_count: usize,
    rx_fifo: VecDeque<CanFrame>,
    rx_callback: Option<CanRxCallback>,
    tx_callback: Option<CanTxCallback>,
    sce_callback: Option<CanSceCallback>,
}

#[derive(Default)]
struct SimState {
    buses: [BusState; 2],
    sent: Vec<(CanBus, CanFrame)>,
    tx_attempts: usize,
    fail_tx: usize,
    responder: Option<Responder>,
}

/// A simulated pair of CAN controllers
///
/// Transmitted frames are recorded, and optionally answered by a [`Responder`]. Received frames
/// are injected with [`SimCanHal::inject_rx`], which raises the receive interrupt the same way
/// the hardware would.
#[derive(Default)]
pub struct SimCanHal {
    state: Mutex<SimState>,
}

impl SimCanHal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the responder for transmitted frames
    pub fn set_responder(
        &self,
        responder: impl Fn(CanBus, &CanFrame) -> Vec<CanFrame> + Send + Sync + 'static,
    ) {
        self.state.lock().unwrap().responder = Some(Arc::new(responder));
    }

    /// Make the next `count` transmit attempts fail, as if all mailboxes were full
    pub fn fail_tx(&self, count: usize) {
        self.state.lock().unwrap().fail_tx = count;
    }

    /// Every frame transmitted so far
    pub fn sent(&self) -> Vec<(CanBus, CanFrame)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// The IDs of every frame transmitted so far
    pub fn sent_ids(&self) -> Vec<u32> {
        self.state.lock().unwrap().sent.iter().map(|(_, f)| f.id).collect()
    }

    /// Number of calls to `tx`, successful or not
    pub fn tx_attempts(&self) -> usize {
        self.state.lock().unwrap().tx_attempts
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    /// The baud rate of `bus`, or None if it is not running
    pub fn baud(&self, bus: CanBus) -> Option<u32> {
        self.state.lock().unwrap().buses[bus.index()].baud
    }

    pub fn deinit_count(&self, bus: CanBus) -> usize {
        self.state.lock().unwrap().buses[bus.index()].deinit_count
    }

    /// Number of frames received but not yet read
    pub fn rx_pending(&self, bus: CanBus) -> usize {
        self.state.lock().unwrap().buses[bus.index()].rx_fifo.len()
    }

    /// Receive a frame on `bus`
    ///
    /// The receive callback runs in interrupt context on the calling thread.
    pub fn inject_rx(&self, bus: CanBus, frame: CanFrame) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            let bus_state = &mut state.buses[bus.index()];
            bus_state.rx_fifo.push_back(frame);
            bus_state.rx_callback.clone()
        };
        if let Some(callback) = callback {
            kernel::run_in_isr(|| callback(bus));
        }
    }

    /// Raise the transmit complete interrupt on `bus`
    pub fn inject_tx_complete(&self, bus: CanBus) {
        let callback = self.state.lock().unwrap().buses[bus.index()]
            .tx_callback
            .clone();
        if let Some(callback) = callback {
            kernel::run_in_isr(|| callback(bus));
        }
    }

    /// Raise the status change interrupt on `bus`
    pub fn inject_sce(&self, bus: CanBus, event: SceEvent) {
        let callback = self.state.lock().unwrap().buses[bus.index()]
            .sce_callback
            .clone();
        if let Some(callback) = callback {
            kernel::run_in_isr(|| callback(bus, event));
        }
    }
}

impl CanHal for SimCanHal {
    fn init(&self, bus: CanBus, baud: u32) {
        self.state.lock().unwrap().buses[bus.index()].baud = Some(baud);
    }

    fn deinit(&self, bus: CanBus) {
        let mut state = self.state.lock().unwrap();
        let bus_state = &mut state.buses[bus.index()];
        bus_state.baud = None;
        bus_state.deinit_count += 1;
    }

    fn tx(&self, bus: CanBus, frame: &CanFrame) -> bool {
        let responder = {
            let mut state = self.state.lock().unwrap();
            state.tx_attempts += 1;
            if state.fail_tx > 0 {
                state.fail_tx -= 1;
                return false;
            }
            state.sent.push((bus, *frame));
            state.responder.clone()
        };
        self.inject_tx_complete(bus);
        if let Some(responder) = responder {
            for reply in responder(bus, frame) {
                self.inject_rx(bus, reply);
            }
        }
        true
    }

    fn rx(&self, bus: CanBus) -> Option<CanFrame> {
        self.state.lock().unwrap().buses[bus.index()]
            .rx_fifo
            .pop_front()
    }

    fn async_rx_start(&self, bus: CanBus, callback: CanRxCallback) {
        self.state.lock().unwrap().buses[bus.index()].rx_callback = Some(callback);
    }

    fn async_tx_complete(&self, bus: CanBus, callback: CanTxCallback) {
        self.state.lock().unwrap().buses[bus.index()].tx_callback = Some(callback);
    }

    fn async_sce(&self, bus: CanBus, callback: CanSceCallback) {
        self.state.lock().unwrap().buses[bus.index()].sce_callback = Some(callback);
    }
}
