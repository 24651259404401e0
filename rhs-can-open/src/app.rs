//! The CAN-open service
//!
//! [`CanOpenApp`] couples the CAN controllers to the object dictionary stacks registered with
//! [`CanOpenApp::start_node`]. The receive interrupt queues frames for the service thread, which
//! dispatches them into the stack under the kernel lock. Frames the stack sends are queued through
//! its [`CanPort`] and handed to the controller by the service thread. Between events the service
//! sleeps until the nearest alarm of any stack, see [`ObjectDictionary::time_dispatch`].
//!
//! Interrupt handlers never touch a dictionary: a transmit passive controller is shut down in the
//! interrupt and the node is stopped by the service thread.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use defmt_or_log::{debug, info, warn};
use rhs_common::{
    nmt::NmtState,
    sdo::RawAbortCode,
    traits::{CanHal, SceEvent},
    CanBus, CanFrame, CanFrameType, NodeId,
};
use rhs_core::{
    event_flag::{EventFlag, FlagOptions},
    kernel::{self, WAIT_FOREVER},
    message_queue::MessageQueue,
    mutex::MutexKind,
    rhs_crash,
    thread::{self, Thread},
    Error,
};
use snafu::Snafu;

use crate::config::CanOpenConfig;
use crate::filter::FilterList;
use crate::object_dict::{
    lock_od, CanOpenAppMessage, CanPort, OdValue, SharedOd, EVENT_PDO, EVENT_RX, EVENT_SCE,
    EVENT_TIMER, EVENT_TX,
};
use crate::sdo::SdoState;

/// Maximum number of object dictionaries served by one app
pub const MAX_OD: usize = 3;

const SERVICE_STACK_SIZE: usize = 2048;

/// Service thread flag: a transmit mailbox was sent
const FLAG_TX_COMPLETED: u32 = 1 << 0;

const SERVICE_EVENTS: u32 = EVENT_RX | EVENT_TX | EVENT_PDO | EVENT_TIMER | EVENT_SCE;

/// Error returned by [`CanOpenApp`] set up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum CanOpenError {
    /// All handler slots are taken
    #[snafu(display("At most {max} object dictionaries can be registered"))]
    TooManyNodes {
        /// The number of slots
        max: usize,
    },
}

#[derive(Clone)]
pub(crate) struct Handler {
    pub(crate) od: SharedOd,
    pub(crate) bus: CanBus,
    pub(crate) port: CanPort,
}

/// State of the CAN-open service
#[allow(missing_debug_implementations)]
pub struct CanOpenApp {
    this: Weak<CanOpenApp>,
    pub(crate) config: CanOpenConfig,
    hal: Arc<dyn CanHal>,
    handlers: critical_section::Mutex<RefCell<heapless::Vec<Handler, MAX_OD>>>,
    rx_queue: Arc<MessageQueue<CanOpenAppMessage>>,
    pub(crate) tx_queue: Arc<MessageQueue<CanOpenAppMessage>>,
    pub(crate) srv_event: Arc<EventFlag>,
    pub(crate) sdo_mutex: rhs_core::Mutex,
    pub(crate) sdo_event: EventFlag,
    pub(crate) sdo: Mutex<SdoState>,
    filter: FilterList,
    /// Buses shut down by the status change interrupt whose nodes are not stopped yet
    passive_buses: AtomicU8,
    service: OnceLock<Thread>,
}

impl CanOpenApp {
    /// Allocate an app without starting its service thread
    pub fn new(hal: Arc<dyn CanHal>, config: CanOpenConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            hal,
            handlers: critical_section::Mutex::new(RefCell::new(heapless::Vec::new())),
            rx_queue: Arc::new(MessageQueue::new(config.rx_queue_len)),
            tx_queue: Arc::new(MessageQueue::new(config.tx_queue_len)),
            srv_event: Arc::new(EventFlag::new()),
            sdo_mutex: rhs_core::Mutex::new(MutexKind::Normal),
            sdo_event: EventFlag::new(),
            sdo: Mutex::new(SdoState::default()),
            filter: FilterList::new(),
            passive_buses: AtomicU8::new(0),
            service: OnceLock::new(),
            config,
        })
    }

    /// Allocate an app and start its service thread
    ///
    /// Nothing is published, see [`can_open_service`](crate::can_open_service) for that.
    pub fn start(hal: Arc<dyn CanHal>, config: CanOpenConfig) -> Arc<Self> {
        let app = Self::new(hal, config);
        app.start_service();
        app
    }

    /// Start the service thread, if it is not running yet
    pub fn start_service(self: &Arc<Self>) {
        self.service.get_or_init(|| {
            let app = self.clone();
            let mut timeout = WAIT_FOREVER;
            let thread = Thread::alloc_service("CanOpen", SERVICE_STACK_SIZE, move || loop {
                timeout = app.process(timeout);
            });
            thread.start();
            thread
        });
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.this.clone()
    }

    /// The service configuration
    pub fn config(&self) -> &CanOpenConfig {
        &self.config
    }

    /// Ids logged by the receive interrupt
    pub fn filter(&self) -> &FilterList {
        &self.filter
    }

    /// Number of registered object dictionaries
    pub fn node_count(&self) -> usize {
        critical_section::with(|cs| self.handlers.borrow_ref(cs).len())
    }

    /// The object dictionary registered in `slot`
    pub fn od(&self, slot: usize) -> Option<SharedOd> {
        self.handler(slot).map(|h| h.od)
    }

    /// The transmit port of the object dictionary registered in `slot`
    pub fn port(&self, slot: usize) -> Option<CanPort> {
        self.handler(slot).map(|h| h.port)
    }

    pub(crate) fn handler(&self, slot: usize) -> Option<Handler> {
        critical_section::with(|cs| self.handlers.borrow_ref(cs).get(slot).cloned())
    }

    fn handler_for_bus(&self, bus: CanBus) -> Option<(usize, Handler)> {
        critical_section::with(|cs| {
            self.handlers
                .borrow_ref(cs)
                .iter()
                .enumerate()
                .find(|(_, h)| h.bus == bus)
                .map(|(slot, h)| (slot, h.clone()))
        })
    }

    fn handlers(&self) -> heapless::Vec<Handler, MAX_OD> {
        critical_section::with(|cs| self.handlers.borrow_ref(cs).clone())
    }

    /// Register an object dictionary on `bus` and bring the node up
    ///
    /// The bus is initialized at `baud` and its interrupts routed to this app. The dictionary is
    /// given its [`CanPort`], assigned `node_id`, and moved to [`NmtState::Initialisation`].
    /// Returns the handler slot.
    pub fn start_node(
        &self,
        od: SharedOd,
        node_id: NodeId,
        bus: CanBus,
        baud: u32,
    ) -> Result<usize, CanOpenError> {
        let port = critical_section::with(|cs| {
            let mut handlers = self.handlers.borrow_ref_mut(cs);
            let port = CanPort::new(
                handlers.len(),
                bus,
                self.tx_queue.clone(),
                self.srv_event.clone(),
            );
            let handler = Handler {
                od: od.clone(),
                bus,
                port: port.clone(),
            };
            handlers
                .push(handler)
                .map(|_| port)
                .map_err(|_| CanOpenError::TooManyNodes { max: MAX_OD })
        })?;
        let slot = port.slot();

        self.hal.init(bus, baud);
        let app = self.this.clone();
        self.hal.async_rx_start(
            bus,
            Arc::new(move |bus: CanBus| {
                if let Some(app) = app.upgrade() {
                    app.on_rx(bus);
                }
            }),
        );
        let app = self.this.clone();
        self.hal.async_tx_complete(
            bus,
            Arc::new(move |bus: CanBus| {
                if let Some(app) = app.upgrade() {
                    app.on_tx_complete(bus);
                }
            }),
        );
        let app = self.this.clone();
        self.hal.async_sce(
            bus,
            Arc::new(move |bus: CanBus, event: SceEvent| {
                if let Some(app) = app.upgrade() {
                    app.on_sce(bus, event);
                }
            }),
        );

        {
            let mut od = lock_od(&od);
            od.attach(port);
            od.set_node_id(node_id);
            od.set_state(NmtState::Initialisation);
        }
        // The new stack's alarms are only known after its first time dispatch
        self.srv_event.set(EVENT_TIMER).ok();
        info!("Node {} started on CAN{}", node_id.raw(), bus);
        Ok(slot)
    }

    /// Write a local entry and schedule a PDO event
    pub fn set_field(
        &self,
        od: &SharedOd,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<(), RawAbortCode> {
        lock_od(od).set_od_entry(index, sub, data)?;
        self.request_pdo();
        Ok(())
    }

    /// Write a typed local entry and schedule a PDO event
    pub fn set_field_value<T: OdValue>(
        &self,
        od: &SharedOd,
        index: u16,
        sub: u8,
        value: T,
    ) -> Result<(), RawAbortCode> {
        self.set_field(od, index, sub, &value.to_le_vec())
    }

    /// Ask the service to send PDOs on every registered dictionary
    pub fn request_pdo(&self) {
        self.srv_event.set(EVENT_PDO).ok();
    }

    /// Wait for service events, or at most `timeout` ms, and handle them
    ///
    /// Returns the time until the nearest alarm, the timeout of the next call.
    fn process(&self, timeout: u32) -> u32 {
        let events = match self
            .srv_event
            .wait(SERVICE_EVENTS, FlagOptions::WAIT_ANY, timeout)
        {
            Ok(events) => events,
            Err(Error::Timeout | Error::ResourceUnavailable) => 0,
            Err(e) => rhs_crash!("CAN-open service event failed: {e}"),
        };

        if events & EVENT_RX != 0 {
            self.process_rx();
        }
        if events & EVENT_SCE != 0 {
            self.process_sce();
        }
        if events & EVENT_PDO != 0 {
            for handler in self.handlers() {
                lock_od(&handler.od).send_pdo_event();
            }
        }
        let next_alarm = self.process_timers();
        self.process_tx();
        next_alarm
    }

    fn process_timers(&self) -> u32 {
        let mut next_alarm = WAIT_FOREVER;
        for handler in self.handlers() {
            let Ok(_lock) = kernel::lock() else {
                rhs_crash!("Kernel lock unavailable");
            };
            if let Some(alarm) = lock_od(&handler.od).time_dispatch(kernel::get_tick()) {
                next_alarm = next_alarm.min(alarm);
            }
        }
        next_alarm
    }

    fn process_sce(&self) {
        let buses = self.passive_buses.swap(0, Ordering::AcqRel);
        for handler in self.handlers() {
            if buses & (1 << handler.bus.index()) != 0 {
                lock_od(&handler.od).set_state(NmtState::Stopped);
                warn!("CAN {} is stopped", handler.bus);
            }
        }
    }

    fn process_rx(&self) {
        while let Ok(msg) = self.rx_queue.get(0) {
            let Some(handler) = self.handler(msg.slot) else {
                rhs_crash!("No object dictionary in slot {}", msg.slot);
            };
            let Ok(_lock) = kernel::lock() else {
                rhs_crash!("Kernel lock unavailable");
            };
            lock_od(&handler.od).dispatch(&msg.message);
        }
    }

    fn process_tx(&self) {
        while let Ok(msg) = self.tx_queue.get(0) {
            let frame = CanFrame::from(msg.message);
            thread::flags_clear(FLAG_TX_COMPLETED).ok();
            let sent = (0..self.config.tx_attempts).any(|attempt| {
                if attempt > 0 {
                    self.wait_tx_mailbox();
                }
                self.hal.tx(msg.bus, &frame)
            });
            if !sent {
                debug!(
                    "Dropped frame 0x{:03X} on CAN{}",
                    msg.message.cob_id, msg.bus
                );
            }
        }
    }

    /// Wait for a transmit mailbox to free up, at most the retry delay
    fn wait_tx_mailbox(&self) {
        let delay = self.config.tx_retry_delay_ms;
        match thread::flags_wait(FLAG_TX_COMPLETED, FlagOptions::WAIT_ANY, delay) {
            Ok(_) | Err(Error::Timeout | Error::ResourceUnavailable) => (),
            // Not called from the service thread
            Err(_) => kernel::delay_ms(delay),
        }
    }

    /// Receive interrupt
    fn on_rx(&self, bus: CanBus) {
        let Some(frame) = self.hal.rx(bus) else {
            return;
        };

        if self.filter.contains(frame.id) {
            let p = frame.payload;
            debug!(
                "CAN{}: ID : {:8x} : LEN {} : {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                bus, frame.id, frame.len, p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]
            );
        }

        if frame.frame_type == CanFrameType::Extended {
            debug!("CAN{}: extended frame 0x{:08X} ignored", bus, frame.id);
            return;
        }

        if let Some((slot, _)) = self.handler_for_bus(bus) {
            let msg = CanOpenAppMessage {
                slot,
                bus,
                message: frame.into(),
            };
            if self.rx_queue.put(msg, 0).is_err() {
                debug!("RX queue full, frame 0x{:03X} dropped", frame.id);
            }
            self.srv_event.set(EVENT_RX).ok();
        }
    }

    /// Transmit complete interrupt
    fn on_tx_complete(&self, _bus: CanBus) {
        if let Some(service) = self.service.get() {
            thread::flags_set(service.id(), FLAG_TX_COMPLETED).ok();
        }
    }

    /// Status change interrupt
    fn on_sce(&self, bus: CanBus, event: SceEvent) {
        // Transmit passive means nobody acknowledges our frames: the line is empty
        if !event.contains(SceEvent::TX_PASSIVE) {
            return;
        }
        if self.handler_for_bus(bus).is_some() {
            self.hal.deinit(bus);
            self.passive_buses
                .fetch_or(1 << bus.index(), Ordering::AcqRel);
            self.srv_event.set(EVENT_SCE).ok();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use rhs_common::{
        sdo::{AbortCode, SdoTransfer},
        traits::{CanRxCallback, CanSceCallback, CanTxCallback},
        Message,
    };

    use super::*;
    use crate::object_dict::{ObjectDictionary, SdoCompletion};

    /// A controller which accepts everything and never receives
    #[derive(Default)]
    pub(crate) struct NullHal {
        pub(crate) inits: Mutex<Vec<(CanBus, u32)>>,
        pub(crate) sent: Mutex<Vec<CanFrame>>,
    }

    impl CanHal for NullHal {
        fn init(&self, bus: CanBus, baud: u32) {
            self.inits.lock().unwrap().push((bus, baud));
        }
        fn deinit(&self, _bus: CanBus) {}
        fn tx(&self, _bus: CanBus, frame: &CanFrame) -> bool {
            self.sent.lock().unwrap().push(*frame);
            true
        }
        fn rx(&self, _bus: CanBus) -> Option<CanFrame> {
            None
        }
        fn async_rx_start(&self, _bus: CanBus, _callback: CanRxCallback) {}
        fn async_tx_complete(&self, _bus: CanBus, _callback: CanTxCallback) {}
        fn async_sce(&self, _bus: CanBus, _callback: CanSceCallback) {}
    }

    /// A stack whose SDO completions are fired by hand
    #[derive(Default)]
    pub(crate) struct ManualOd {
        pub(crate) node_id: Option<NodeId>,
        pub(crate) state: Option<NmtState>,
        pub(crate) port: Option<CanPort>,
        pub(crate) pending: VecDeque<(u16, u8, SdoCompletion)>,
        pub(crate) written: Vec<(u16, u8, Vec<u8>)>,
        pub(crate) reject: Option<u8>,
        pub(crate) resets: usize,
        pub(crate) entries: Vec<(u16, u8, Vec<u8>)>,
    }

    impl ObjectDictionary for ManualOd {
        fn attach(&mut self, port: CanPort) {
            self.port = Some(port);
        }
        fn set_node_id(&mut self, node_id: NodeId) {
            self.node_id = Some(node_id);
        }
        fn set_state(&mut self, state: NmtState) {
            self.state = Some(state);
        }
        fn state(&self) -> NmtState {
            self.state.unwrap_or(NmtState::Unknown)
        }
        fn dispatch(&mut self, _message: &Message) {}
        fn send_pdo_event(&mut self) {}
        fn read_network_dict(
            &mut self,
            _node_id: u8,
            index: u16,
            sub: u8,
            completion: SdoCompletion,
        ) -> Result<(), u8> {
            if let Some(code) = self.reject {
                return Err(code);
            }
            self.pending.push_back((index, sub, completion));
            Ok(())
        }
        fn write_network_dict(
            &mut self,
            _node_id: u8,
            index: u16,
            sub: u8,
            data: &[u8],
            completion: SdoCompletion,
        ) -> Result<(), u8> {
            if let Some(code) = self.reject {
                return Err(code);
            }
            self.written.push((index, sub, data.to_vec()));
            self.pending.push_back((index, sub, completion));
            Ok(())
        }
        fn reset_sdo(&mut self) {
            self.resets += 1;
        }
        fn get_od_entry(
            &self,
            index: u16,
            sub: u8,
            buf: &mut [u8],
        ) -> Result<usize, RawAbortCode> {
            let (_, _, data) = self
                .entries
                .iter()
                .find(|(i, s, _)| *i == index && *s == sub)
                .ok_or(RawAbortCode::Valid(AbortCode::NoSuchObject))?;
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
        fn set_od_entry(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), RawAbortCode> {
            self.entries.retain(|(i, s, _)| !(*i == index && *s == sub));
            self.entries.push((index, sub, data.to_vec()));
            Ok(())
        }
    }

    impl ManualOd {
        /// Complete the oldest pending transfer
        pub(crate) fn complete_next(&mut self, transfer: impl FnOnce(u16, u8) -> SdoTransfer) {
            let (index, sub, completion) = self.pending.pop_front().unwrap();
            completion(&transfer(index, sub));
        }
    }

    pub(crate) fn app_with_od(config: CanOpenConfig) -> (Arc<CanOpenApp>, Arc<Mutex<ManualOd>>) {
        let app = CanOpenApp::new(Arc::new(NullHal::default()), config);
        let od = Arc::new(Mutex::new(ManualOd::default()));
        app.start_node(od.clone(), NodeId::new(1).unwrap(), CanBus::Can1, 125_000)
            .unwrap();
        (app, od)
    }

    #[test]
    fn test_start_node_limit() {
        let hal = Arc::new(NullHal::default());
        let app = CanOpenApp::new(hal.clone(), CanOpenConfig::default());
        for i in 0..MAX_OD {
            let od = Arc::new(Mutex::new(ManualOd::default()));
            let slot = app
                .start_node(od.clone(), NodeId::new(i as u8 + 1).unwrap(), CanBus::Can1, 250_000)
                .unwrap();
            assert_eq!(i, slot);
            let od = od.lock().unwrap();
            assert_eq!(Some(NmtState::Initialisation), od.state);
            assert_eq!(Some(NodeId::new(i as u8 + 1).unwrap()), od.node_id);
            assert_eq!(Some(i), od.port.as_ref().map(|p| p.slot()));
        }
        let result = app.start_node(
            Arc::new(Mutex::new(ManualOd::default())),
            NodeId::new(10).unwrap(),
            CanBus::Can2,
            250_000,
        );
        assert_eq!(Err(CanOpenError::TooManyNodes { max: MAX_OD }), result);
        assert_eq!(MAX_OD, app.node_count());
        assert_eq!(MAX_OD, hal.inits.lock().unwrap().len());
    }

    #[test]
    fn test_set_field_requests_pdo() {
        let (app, od) = app_with_od(CanOpenConfig::default());
        let shared: SharedOd = od.clone();
        app.set_field_value(&shared, 0x2000, 1, 0xBEEFu16).unwrap();
        assert_eq!(EVENT_PDO, app.srv_event.get() & EVENT_PDO);
        assert_eq!(
            Ok(0xBEEFu16),
            crate::object_dict::od_get_field::<u16>(&shared, 0x2000, 1)
        );
        assert_eq!(
            Err(RawAbortCode::Valid(AbortCode::DataTypeMismatch)),
            crate::object_dict::od_get_field::<u32>(&shared, 0x2000, 1)
        );
    }
}
