//! Threads and services
//!
//! A [`Thread`] goes through `Stopped -> Starting -> Running -> Stopping -> Stopped`. When the
//! callback of a regular thread returns, the thread posts itself to the scrub queue, and the scrub
//! service reaps the OS thread and moves it to `Stopped`. [`Thread::join`] blocks until that has
//! happened.
//!
//! Services are threads which never return. A service callback returning crashes.
//!
//! Every thread also carries 31 bits of thread flags, see [`flags_set`] and [`flags_wait`].

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;

use crate::event_flag::{EventFlag, FlagOptions};
use crate::kernel::{is_irq, lock_state, WAIT_FOREVER};
use crate::message_queue::MessageQueue;
use crate::status::{Error, Result};
use crate::{rhs_assert, rhs_crash};

/// Number of usable thread flag bits
pub const THREAD_FLAG_BITS: u32 = 31;
/// Stack size given to the scrub service
pub const SCRUB_STACK_SIZE: usize = 1024;
/// Smallest stack given to an OS thread, whatever the requested size
pub const MIN_HOST_STACK_SIZE: usize = 64 * 1024;

const SCRUB_QUEUE_LEN: usize = 8;
const STOPPED_EVENT: u32 = 1 << 0;

/// Lifecycle state of a thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Not running; may be started
    Stopped,
    /// Started, body not yet entered
    Starting,
    /// Callback is running
    Running,
    /// Callback returned, waiting to be reaped
    Stopping,
}

/// Scheduling priority
///
/// Priorities are advisory on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadPriority {
    /// Idle
    Idle = 0,
    /// Init
    Init = 4,
    /// Lowest application priority
    Lowest = 14,
    /// Low
    Low = 15,
    /// Default priority
    Normal = 16,
    /// High
    High = 17,
    /// Highest application priority
    Highest = 18,
    /// Deferred interrupt processing
    Isr = 31,
}

/// Identifies a thread
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    /// The raw numeric ID
    pub fn raw(&self) -> u32 {
        self.0
    }
}

type ThreadCallback = Box<dyn FnMut() -> i32 + Send>;
type StateCallback = Arc<dyn Fn(ThreadState) + Send + Sync>;

struct ThreadInner {
    id: ThreadId,
    name: Mutex<Option<String>>,
    priority: ThreadPriority,
    stack_size: usize,
    is_service: bool,
    state: Mutex<ThreadState>,
    state_callback: Mutex<Option<StateCallback>>,
    callback: Mutex<Option<ThreadCallback>>,
    ret: AtomicI32,
    flags: EventFlag,
    stopped: EventFlag,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadInner {
    fn state(&self) -> ThreadState {
        *lock_state(&self.state)
    }

    fn set_state(&self, state: ThreadState) {
        *lock_state(&self.state) = state;
        let callback = lock_state(&self.state_callback).clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    fn label(&self) -> String {
        lock_state(&self.name)
            .clone()
            .unwrap_or_else(|| format!("thread {}", self.id.0))
    }
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);
static REGISTRY: Mutex<BTreeMap<ThreadId, Weak<ThreadInner>>> = Mutex::new(BTreeMap::new());

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadInner>>> = const { RefCell::new(None) };
}

struct Scrubber {
    queue: Arc<MessageQueue<Arc<ThreadInner>>>,
    _service: Thread,
}

static SCRUBBER: OnceLock<Scrubber> = OnceLock::new();

fn scrub(queue: &MessageQueue<Arc<ThreadInner>>) -> i32 {
    loop {
        let Ok(thread) = queue.get(WAIT_FOREVER) else {
            rhs_crash!("Scrub queue failed");
        };
        let handle = lock_state(&thread.handle).take();
        if let Some(handle) = handle {
            // The body has already left the callback, so a panic can only come from a crash
            // which was logged there
            handle.join().ok();
        }
        lock_state(&REGISTRY).remove(&thread.id);
        thread.set_state(ThreadState::Stopped);
        thread.stopped.set(STOPPED_EVENT).ok();
        log::debug!(target: "Thread", "{} deleted", thread.label());
    }
}

fn scrub_queue() -> &'static MessageQueue<Arc<ThreadInner>> {
    &SCRUBBER
        .get_or_init(|| {
            let queue = Arc::new(MessageQueue::new(SCRUB_QUEUE_LEN));
            let service = {
                let queue = queue.clone();
                Thread::alloc_service("ThreadScrub", SCRUB_STACK_SIZE, move || scrub(&queue))
            };
            service.start();
            Scrubber {
                queue,
                _service: service,
            }
        })
        .queue
}

/// Start the scrub service
///
/// Called once at boot. Starting a thread also starts the service if this was skipped.
pub fn init() {
    scrub_queue();
}

fn body(inner: Arc<ThreadInner>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(inner.clone()));

    rhs_assert!(inner.state() == ThreadState::Starting);
    inner.set_state(ThreadState::Running);

    let Some(mut callback) = lock_state(&inner.callback).take() else {
        rhs_crash!("Thread {} has no callback", inner.label());
    };
    let ret = callback();
    *lock_state(&inner.callback) = Some(callback);
    inner.ret.store(ret, Ordering::Release);

    if inner.is_service {
        rhs_crash!("Service {} returned", inner.label());
    }
    rhs_assert!(inner.state() == ThreadState::Running);
    inner.set_state(ThreadState::Stopping);

    CURRENT.with(|c| c.borrow_mut().take());
    if scrub_queue().put(inner, WAIT_FOREVER).is_err() {
        rhs_crash!("Failed to queue thread for scrubbing");
    }
}

/// A thread handle
pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .field("name", &lock_state(&self.inner.name))
            .field("state", &self.inner.state())
            .field("is_service", &self.inner.is_service)
            .finish()
    }
}

impl Thread {
    /// Allocate a thread with [`ThreadPriority::Normal`]
    pub fn alloc(
        name: &str,
        stack_size: usize,
        callback: impl FnMut() -> i32 + Send + 'static,
    ) -> Self {
        Self::alloc_ex(name, stack_size, ThreadPriority::Normal, callback)
    }

    /// Allocate a thread with an explicit priority
    pub fn alloc_ex(
        name: &str,
        stack_size: usize,
        priority: ThreadPriority,
        callback: impl FnMut() -> i32 + Send + 'static,
    ) -> Self {
        Self::build(name, stack_size, priority, false, Box::new(callback))
    }

    /// Allocate a service: a thread whose callback never returns
    pub fn alloc_service(
        name: &str,
        stack_size: usize,
        callback: impl FnMut() -> i32 + Send + 'static,
    ) -> Self {
        Self::build(
            name,
            stack_size,
            ThreadPriority::Normal,
            true,
            Box::new(callback),
        )
    }

    fn build(
        name: &str,
        stack_size: usize,
        priority: ThreadPriority,
        is_service: bool,
        callback: ThreadCallback,
    ) -> Self {
        let stopped = EventFlag::new();
        stopped.set(STOPPED_EVENT).ok();
        let inner = ThreadInner {
            id: ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name: Mutex::new(Some(name.to_owned())),
            priority,
            stack_size,
            is_service,
            state: Mutex::new(ThreadState::Stopped),
            state_callback: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
            ret: AtomicI32::new(0),
            flags: EventFlag::with_bits(THREAD_FLAG_BITS),
            stopped,
            handle: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start the thread
    ///
    /// The thread must be stopped.
    pub fn start(&self) {
        let inner = &self.inner;
        rhs_assert!(inner.stack_size > 0);
        rhs_assert!(inner.state() == ThreadState::Stopped);
        if !inner.is_service {
            // Make sure there is someone to reap the thread
            scrub_queue();
        }

        inner.stopped.clear(STOPPED_EVENT).ok();
        inner.set_state(ThreadState::Starting);
        lock_state(&REGISTRY).insert(inner.id, Arc::downgrade(inner));

        let mut builder =
            std::thread::Builder::new().stack_size(inner.stack_size.max(MIN_HOST_STACK_SIZE));
        if let Some(name) = lock_state(&inner.name).clone() {
            builder = builder.name(name);
        }
        // Hold the handle slot so the scrubber cannot look at it before the handle is stored
        let mut handle = lock_state(&inner.handle);
        let body_inner = inner.clone();
        match builder.spawn(move || body(body_inner)) {
            Ok(h) => *handle = Some(h),
            Err(e) => rhs_crash!("Failed to spawn thread {}: {e}", inner.label()),
        }
    }

    /// Wait for the thread to stop and return its callback's return value
    ///
    /// Returns immediately if the thread was never started. Joining a service, or the calling
    /// thread itself, fails with `InvalidParameter`.
    pub fn join(&self) -> Result<i32> {
        if self.inner.is_service || Self::current_id() == Some(self.inner.id) {
            return Err(Error::InvalidParameter);
        }
        self.inner.stopped.wait(
            STOPPED_EVENT,
            FlagOptions::WAIT_ANY | FlagOptions::NO_CLEAR,
            WAIT_FOREVER,
        )?;
        Ok(self.return_code())
    }

    /// Release a stopped thread
    pub fn free(self) {
        rhs_assert!(!self.inner.is_service);
        rhs_assert!(self.inner.state() == ThreadState::Stopped);
    }

    /// Register a callback which observes every state transition
    ///
    /// It runs on the thread causing the transition.
    pub fn set_state_callback(&self, callback: impl Fn(ThreadState) + Send + Sync + 'static) {
        *lock_state(&self.inner.state_callback) = Some(Arc::new(callback));
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        self.inner.state()
    }

    /// The thread name
    pub fn name(&self) -> Option<String> {
        lock_state(&self.inner.name).clone()
    }

    /// Rename the thread
    ///
    /// The OS thread keeps the name it was started with.
    pub fn set_name(&self, name: Option<&str>) {
        *lock_state(&self.inner.name) = name.map(str::to_owned);
    }

    /// Scheduling priority
    pub fn priority(&self) -> ThreadPriority {
        self.inner.priority
    }

    /// Requested stack size in bytes
    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    /// Returns true for services
    pub fn is_service(&self) -> bool {
        self.inner.is_service
    }

    /// ID of this thread
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// Value returned by the last run of the callback
    pub fn return_code(&self) -> i32 {
        self.inner.ret.load(Ordering::Acquire)
    }

    /// ID of the calling thread, if it is an RHS thread
    pub fn current_id() -> Option<ThreadId> {
        CURRENT.with(|c| c.borrow().as_ref().map(|t| t.id))
    }
}

fn with_current<R>(f: impl FnOnce(&ThreadInner) -> Result<R>) -> Result<R> {
    let current = CURRENT.with(|c| c.borrow().clone());
    match current {
        Some(thread) => f(&thread),
        None => Err(Error::InvalidParameter),
    }
}

/// Set flags on thread `id`
///
/// Allowed from interrupt context. Returns the flags after setting.
pub fn flags_set(id: ThreadId, flags: u32) -> Result<u32> {
    let thread = lock_state(&REGISTRY).get(&id).and_then(Weak::upgrade);
    match thread {
        Some(thread) => thread.flags.set(flags),
        None => Err(Error::InvalidParameter),
    }
}

/// Clear flags of the calling thread, returning the flags before clearing
pub fn flags_clear(flags: u32) -> Result<u32> {
    if is_irq() {
        return Err(Error::NotAllowedFromInterrupt);
    }
    with_current(|t| t.flags.clear(flags))
}

/// Get the flags of the calling thread
pub fn flags_get() -> Result<u32> {
    if is_irq() {
        return Err(Error::NotAllowedFromInterrupt);
    }
    with_current(|t| Ok(t.flags.get()))
}

/// Wait for flags of the calling thread, see [`EventFlag::wait`]
pub fn flags_wait(flags: u32, options: FlagOptions, timeout: u32) -> Result<u32> {
    with_current(|t| t.flags.wait(flags, options, timeout))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use assertables::assert_contains;

    use super::*;
    use crate::kernel::run_in_isr;

    #[test]
    fn test_join_returns_value() {
        let thread = Thread::alloc("Worker", 1024, || 42);
        assert_eq!(ThreadState::Stopped, thread.state());
        assert_eq!(Ok(0), thread.join());
        thread.start();
        assert_eq!(Ok(42), thread.join());
        assert_eq!(ThreadState::Stopped, thread.state());
        thread.free();
    }

    #[test]
    fn test_state_transitions() {
        let (tx, rx) = mpsc::channel();
        let thread = Thread::alloc_ex("States", 512, ThreadPriority::High, || 0);
        thread.set_state_callback(move |s| tx.send(s).unwrap());
        thread.start();
        thread.join().unwrap();
        let states: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            vec![
                ThreadState::Starting,
                ThreadState::Running,
                ThreadState::Stopping,
                ThreadState::Stopped
            ],
            states
        );
        assert_eq!(ThreadPriority::High, thread.priority());
    }

    #[test]
    fn test_restart() {
        let mut runs = 0;
        let thread = Thread::alloc("Again", 512, move || {
            runs += 1;
            runs
        });
        thread.start();
        assert_eq!(Ok(1), thread.join());
        thread.start();
        assert_eq!(Ok(2), thread.join());
    }

    #[test]
    fn test_join_self_and_service_rejected() {
        let (tx, rx) = mpsc::channel::<Arc<Mutex<Option<Thread>>>>();
        let thread = Arc::new(Mutex::new(None));
        let slot = thread.clone();
        let t = Thread::alloc("SelfJoin", 512, move || {
            let slot: Arc<Mutex<Option<Thread>>> = rx.recv().unwrap();
            let guard = slot.lock().unwrap();
            guard.as_ref().unwrap().join().unwrap_err().code()
        });
        let id = t.id();
        *slot.lock().unwrap() = Some(Thread {
            inner: t.inner.clone(),
        });
        t.start();
        tx.send(thread).unwrap();
        assert_eq!(Ok(Error::InvalidParameter.code()), t.join());
        assert_eq!(Err(Error::InvalidParameter), flags_set(id, 1));

        let service = Thread::alloc_service("Service", 512, || loop {
            std::thread::park();
        });
        assert_eq!(Err(Error::InvalidParameter), service.join());
        assert!(service.is_service());
    }

    #[test]
    fn test_thread_flags() {
        let (tx, rx) = mpsc::channel();
        let thread = Thread::alloc("Flags", 512, move || {
            tx.send(()).unwrap();
            let flags = flags_wait(0b110, FlagOptions::WAIT_ALL, WAIT_FOREVER).unwrap();
            assert_eq!(Ok(0), flags_get());
            flags as i32
        });
        thread.start();
        rx.recv().unwrap();
        flags_set(thread.id(), 0b010).unwrap();
        run_in_isr(|| flags_set(thread.id(), 0b100)).unwrap();
        assert_eq!(Ok(0b110), thread.join());
    }

    #[test]
    fn test_flags_need_rhs_thread() {
        assert_eq!(Err(Error::InvalidParameter), flags_get());
        assert_eq!(None, Thread::current_id());
    }

    #[test]
    fn test_debug_format() {
        let thread = Thread::alloc("Named", 512, || 0);
        thread.set_name(Some("Renamed"));
        assert_eq!(Some("Renamed".to_string()), thread.name());
        assert_contains!(format!("{thread:?}"), "Renamed");
    }
}
