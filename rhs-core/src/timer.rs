//! Software timers
//!
//! Timers are driven by the timer service, started on first use. Callbacks run on the service
//! thread, one at a time, so a slow callback delays every other timer.
//!
//! Starting, restarting and stopping a timer only update the service's schedule. A callback which
//! the service has already picked up still runs once after [`Timer::stop`]; [`Timer::free`] waits
//! until the service has let go of the timer.

use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::api_lock::ApiLock;
use crate::event_flag::{EventFlag, FlagOptions};
use crate::kernel::{get_tick, is_irq, lock_state, WAIT_FOREVER};
use crate::message_queue::MessageQueue;
use crate::status::{Error, Result};
use crate::thread::Thread;
use crate::{rhs_assert, rhs_crash};

/// Stack size given to the timer service
pub const TIMER_STACK_SIZE: usize = 1024;

const PENDING_QUEUE_LEN: usize = 16;
const WAKE_EVENT: u32 = 1 << 0;

/// Whether a timer fires once or keeps firing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerType {
    /// Fires once, then stops
    Once,
    /// Fires every period until stopped
    Periodic,
}

type TimerCallback = Box<dyn FnMut() + Send>;
type PendingCall = Box<dyn FnOnce() + Send>;

struct TimerInner {
    id: u32,
    kind: TimerType,
    callback: Mutex<TimerCallback>,
}

struct Armed {
    timer: Arc<TimerInner>,
    period: u32,
    expiry: u32,
}

struct TimerService {
    armed: Mutex<BTreeMap<u32, Armed>>,
    pending: MessageQueue<PendingCall>,
    wake: EventFlag,
    thread: OnceLock<Thread>,
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);
static SERVICE: OnceLock<Arc<TimerService>> = OnceLock::new();

/// Ticks from `now` until `expiry`, zero once it has passed
fn remaining(expiry: u32, now: u32) -> u32 {
    (expiry.wrapping_sub(now) as i32).max(0) as u32
}

impl TimerService {
    fn next_timeout(&self) -> u32 {
        let now = get_tick();
        lock_state(&self.armed)
            .values()
            .map(|a| remaining(a.expiry, now))
            .min()
            .unwrap_or(WAIT_FOREVER)
    }

    fn run_pending(&self) {
        while let Ok(call) = self.pending.get(0) {
            call();
        }
    }

    fn run_due(&self) {
        let now = get_tick();
        let due: Vec<Arc<TimerInner>> = {
            let mut armed = lock_state(&self.armed);
            let ids: Vec<u32> = armed
                .iter()
                .filter(|(_, a)| remaining(a.expiry, now) == 0)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| match armed.get_mut(&id) {
                    Some(a) if a.timer.kind == TimerType::Periodic => {
                        a.expiry = a.expiry.wrapping_add(a.period);
                        // Skip the periods which were missed
                        if remaining(a.expiry, now) == 0 {
                            a.expiry = now.wrapping_add(a.period);
                        }
                        Some(a.timer.clone())
                    }
                    Some(_) => armed.remove(&id).map(|a| a.timer),
                    None => None,
                })
                .collect()
        };
        for timer in due {
            let mut callback = lock_state(&timer.callback);
            (*callback)();
        }
    }

    fn process(&self) {
        match self
            .wake
            .wait(WAKE_EVENT, FlagOptions::WAIT_ANY, self.next_timeout())
        {
            Ok(_) | Err(Error::Timeout | Error::ResourceUnavailable) => (),
            Err(e) => rhs_crash!("Timer service wait failed: {e}"),
        }
        self.run_pending();
        self.run_due();
    }

    fn wake(&self) {
        self.wake.set(WAKE_EVENT).ok();
    }
}

fn service() -> &'static TimerService {
    SERVICE.get_or_init(|| {
        let service = Arc::new(TimerService {
            armed: Mutex::new(BTreeMap::new()),
            pending: MessageQueue::new(PENDING_QUEUE_LEN),
            wake: EventFlag::new(),
            thread: OnceLock::new(),
        });
        let thread = {
            let service = service.clone();
            Thread::alloc_service("TimerSvc", TIMER_STACK_SIZE, move || loop {
                service.process();
            })
        };
        thread.start();
        service.thread.get_or_init(|| thread);
        service
    })
}

/// Start the timer service
///
/// Called once at boot. The first timer starts the service if this was skipped.
pub fn init() {
    service();
}

/// Run `callback` on the timer service thread
///
/// Allowed from interrupt context. Crashes if too many calls are already waiting.
pub fn pending_callback(callback: impl FnOnce() + Send + 'static) {
    let service = service();
    let timeout = if is_irq() { 0 } else { WAIT_FOREVER };
    if let Err(e) = service.pending.put(Box::new(callback), timeout) {
        rhs_crash!("Failed to queue timer call: {e}");
    }
    service.wake();
}

/// A software timer
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Timer {
    /// Allocate a stopped timer
    pub fn alloc(kind: TimerType, callback: impl FnMut() + Send + 'static) -> Self {
        rhs_assert!(!is_irq());
        service();
        Self {
            inner: Arc::new(TimerInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                callback: Mutex::new(Box::new(callback)),
            }),
        }
    }

    /// Fire after `ticks`, and for periodic timers every `ticks` after that
    ///
    /// A running timer is rescheduled from now.
    pub fn start(&self, ticks: u32) -> Result<()> {
        rhs_assert!(!is_irq());
        rhs_assert!(ticks > 0 && ticks < WAIT_FOREVER);
        let service = service();
        lock_state(&service.armed).insert(
            self.inner.id,
            Armed {
                timer: self.inner.clone(),
                period: ticks,
                expiry: get_tick().wrapping_add(ticks),
            },
        );
        service.wake();
        Ok(())
    }

    /// Restart with a new period, see [`Timer::start`]
    pub fn restart(&self, ticks: u32) -> Result<()> {
        self.start(ticks)
    }

    /// Stop the timer
    pub fn stop(&self) -> Result<()> {
        rhs_assert!(!is_irq());
        let service = service();
        lock_state(&service.armed).remove(&self.inner.id);
        service.wake();
        Ok(())
    }

    /// Returns true while the timer is scheduled
    pub fn is_running(&self) -> bool {
        lock_state(&service().armed).contains_key(&self.inner.id)
    }

    /// Tick at which the timer fires next, if it is running
    pub fn expire_time(&self) -> Option<u32> {
        lock_state(&service().armed)
            .get(&self.inner.id)
            .map(|a| a.expiry)
    }

    /// Stop the timer and wait until the service no longer uses it
    ///
    /// Must not be called from a timer callback.
    pub fn free(self) {
        rhs_assert!(!is_irq());
        let service = service();
        rhs_assert!(
            service.thread.get().map(Thread::id) != Thread::current_id(),
            "Timer freed from the timer service"
        );
        lock_state(&service.armed).remove(&self.inner.id);

        // Everything the service picked up before the removal is done once this call runs
        let done = ApiLock::new_locked();
        let unlock = done.clone();
        pending_callback(move || unlock.unlock());
        if let Err(e) = done.wait_unlock_and_free() {
            rhs_crash!("Failed to wait for the timer service: {e}");
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(service) = SERVICE.get() {
            lock_state(&service.armed).remove(&self.inner.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use assertables::{assert_ge, assert_in_range};

    use super::*;
    use crate::kernel;

    fn counting(kind: TimerType) -> (Timer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = {
            let count = count.clone();
            Timer::alloc(kind, move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (timer, count)
    }

    fn wait_for(count: &AtomicUsize, at_least: usize) {
        let start = Instant::now();
        while count.load(Ordering::SeqCst) < at_least {
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_once_fires_once() {
        let (timer, count) = counting(TimerType::Once);
        assert!(!timer.is_running());
        timer.start(10).unwrap();
        assert!(timer.is_running());
        wait_for(&count, 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(!timer.is_running());
        assert_eq!(None, timer.expire_time());
        timer.free();
    }

    #[test]
    fn test_periodic_until_stopped() {
        let (timer, count) = counting(TimerType::Periodic);
        timer.start(5).unwrap();
        wait_for(&count, 3);
        assert!(timer.is_running());
        timer.stop().unwrap();
        assert!(!timer.is_running());
        // A callback already picked up may still complete
        std::thread::sleep(Duration::from_millis(20));
        let stopped_at = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stopped_at, count.load(Ordering::SeqCst));
        timer.free();
    }

    #[test]
    fn test_restart_pushes_expiry() {
        let (timer, count) = counting(TimerType::Once);
        let start = kernel::get_tick();
        timer.start(100).unwrap();
        let first = timer.expire_time().unwrap();
        assert_in_range!(first, start + 100..start + 120);

        std::thread::sleep(Duration::from_millis(50));
        timer.restart(100).unwrap();
        assert_ge!(timer.expire_time().unwrap(), first + 40);
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(0, count.load(Ordering::SeqCst));
        wait_for(&count, 1);
        timer.free();
    }

    #[test]
    fn test_free_stops_timer() {
        let (timer, count) = counting(TimerType::Periodic);
        timer.start(1000).unwrap();
        timer.free();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn test_pending_callback_from_isr() {
        let done = ApiLock::new_locked();
        let on_service = Arc::new(Mutex::new(None));
        {
            let done = done.clone();
            let on_service = on_service.clone();
            kernel::run_in_isr(|| {
                pending_callback(move || {
                    *on_service.lock().unwrap() = Thread::current_id();
                    done.unlock();
                })
            });
        }
        done.wait_unlock_and_free().unwrap();
        let service_id = service().thread.get().map(Thread::id);
        assert!(service_id.is_some());
        assert_eq!(service_id, *on_service.lock().unwrap());
    }
}
