//! Kernel services: tick source, interrupt context and the kernel lock
//!
//! Interrupt context is tracked per thread. HAL layers run their interrupt handlers through
//! [`run_in_isr`], and every primitive in this crate checks [`is_irq`] to pick its interrupt safe
//! behaviour.

use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError},
    thread::ThreadId,
    time::{Duration, Instant},
};

use crate::status::{Error, Result};

/// Timeout value which blocks until the resource becomes available
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Kernel tick rate
pub const TICK_FREQUENCY_HZ: u32 = 1000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

thread_local! {
    static ISR_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Milliseconds since the kernel started
///
/// Wraps after about 49 days, like the hardware tick counter.
pub fn get_tick() -> u32 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u32
}

/// Convert milliseconds to kernel ticks
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms * (TICK_FREQUENCY_HZ / 1000)
}

/// Block the calling thread for `ms` milliseconds
pub fn delay_ms(ms: u32) {
    crate::rhs_assert!(!is_irq());
    std::thread::sleep(Duration::from_millis(ms as u64));
}

/// Block the calling thread for `ticks` kernel ticks
pub fn delay_tick(ticks: u32) {
    crate::rhs_assert!(!is_irq());
    std::thread::sleep(ticks_to_duration(ticks));
}

/// Wall time of `ticks` kernel ticks
pub fn ticks_to_duration(ticks: u32) -> Duration {
    Duration::from_micros(ticks as u64 * 1_000_000 / TICK_FREQUENCY_HZ as u64)
}

/// Returns true when called from interrupt context
pub fn is_irq() -> bool {
    ISR_DEPTH.with(|d| d.get() > 0)
}

struct IsrScope;

impl IsrScope {
    fn enter() -> Self {
        ISR_DEPTH.with(|d| d.set(d.get() + 1));
        IsrScope
    }
}

impl Drop for IsrScope {
    fn drop(&mut self) {
        ISR_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Run `f` in interrupt context
///
/// Nested calls are allowed. Anything `f` does is subject to the same restrictions as an interrupt
/// handler: no blocking waits, no mutexes.
pub fn run_in_isr<R>(f: impl FnOnce() -> R) -> R {
    let _scope = IsrScope::enter();
    f()
}

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

struct KernelLock {
    state: Mutex<LockState>,
    released: Condvar,
}

static KERNEL_LOCK: KernelLock = KernelLock {
    state: Mutex::new(LockState {
        owner: None,
        depth: 0,
    }),
    released: Condvar::new(),
};

/// Holds the kernel lock until dropped
///
/// The guard is tied to the thread which took it.
#[derive(Debug)]
#[must_use = "the kernel lock is released when the guard is dropped"]
pub struct KernelLockGuard {
    _not_send: PhantomData<*const ()>,
}

/// Take the kernel lock
///
/// While held, no other thread can take the lock, which serializes protocol processing against
/// every other user of the lock. The lock nests: a thread which already holds it may take it again.
pub fn lock() -> Result<KernelLockGuard> {
    if is_irq() {
        return Err(Error::NotAllowedFromInterrupt);
    }
    let me = std::thread::current().id();
    let mut state = lock_state(&KERNEL_LOCK.state);
    if state.owner == Some(me) {
        state.depth += 1;
    } else {
        state = KERNEL_LOCK
            .released
            .wait_while(state, |s| s.owner.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        state.owner = Some(me);
        state.depth = 1;
    }
    Ok(KernelLockGuard {
        _not_send: PhantomData,
    })
}

impl Drop for KernelLockGuard {
    fn drop(&mut self) {
        let mut state = lock_state(&KERNEL_LOCK.state);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            KERNEL_LOCK.released.notify_all();
        }
    }
}

/// Returns true if any thread holds the kernel lock
pub fn is_locked() -> bool {
    lock_state(&KERNEL_LOCK.state).owner.is_some()
}

/// Nesting depth of the kernel lock held by the calling thread
pub fn lock_depth() -> u32 {
    let me = std::thread::current().id();
    let state = lock_state(&KERNEL_LOCK.state);
    if state.owner == Some(me) {
        state.depth
    } else {
        0
    }
}

/// Lock a std mutex, ignoring poisoning
///
/// A panic while holding one of the internal mutexes is a crash of the whole layer, so the data is
/// still used as-is afterwards.
pub(crate) fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `cond` while `blocked` holds, for at most `timeout` ms
///
/// Returns the guard and whether the wait gave up with the condition still blocked.
pub(crate) fn wait_while<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: u32,
    blocked: impl FnMut(&mut T) -> bool,
) -> (MutexGuard<'a, T>, bool) {
    if timeout == WAIT_FOREVER {
        let guard = cond
            .wait_while(guard, blocked)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, false)
    } else {
        let (guard, result) = cond
            .wait_timeout_while(guard, Duration::from_millis(timeout as u64), blocked)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn test_isr_context_nests() {
        assert!(!is_irq());
        run_in_isr(|| {
            assert!(is_irq());
            run_in_isr(|| assert!(is_irq()));
            assert!(is_irq());
        });
        assert!(!is_irq());
    }

    #[test]
    fn test_lock_rejected_in_isr() {
        assert_eq!(
            Error::NotAllowedFromInterrupt,
            run_in_isr(lock).unwrap_err()
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_kernel_lock_nests_and_excludes() {
        let outer = lock().unwrap();
        let inner = lock().unwrap();
        assert_eq!(2, lock_depth());
        drop(inner);
        assert_eq!(1, lock_depth());

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let entered = entered.clone();
            std::thread::spawn(move || {
                let _guard = lock().unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));
        drop(outer);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(0, lock_depth());
        assert!(!is_locked());
    }

    #[test]
    fn test_tick_advances() {
        let start = get_tick();
        delay_ms(5);
        assert!(get_tick() >= start + 5);
        delay_tick(3);
        assert!(get_tick() >= start + 8);
    }

    #[test]
    fn test_long_tick_delays() {
        assert_eq!(Duration::from_millis(2), ticks_to_duration(2));
        assert_eq!(
            Duration::from_millis(u32::MAX as u64),
            ticks_to_duration(u32::MAX)
        );
    }
}
