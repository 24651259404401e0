use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use rhs_core::{
    kernel::{self, WAIT_FOREVER},
    record,
    thread::{self, ThreadState},
    ApiLock, EventFlag, FlagOptions, MessageQueue, Mutex, MutexKind, Semaphore, Thread,
};

/// A producer publishes its queue as a record; a consumer started first finds it and drains it
#[test]
#[serial_test::serial]
fn test_producer_consumer_through_record() {
    const RECORD: &str = "samples";

    let consumer = Thread::alloc("Consumer", 1024, || {
        let queue = record::open::<MessageQueue<u32>>(RECORD);
        let mut sum = 0;
        for _ in 0..10 {
            sum += queue.get(WAIT_FOREVER).unwrap();
        }
        record::close(RECORD);
        sum as i32
    });
    consumer.start();
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(ThreadState::Running, consumer.state());

    let producer = Thread::alloc("Producer", 1024, || {
        let queue = Arc::new(MessageQueue::<u32>::new(4));
        record::create(RECORD, queue.clone());
        for i in 1..=10 {
            queue.put(i, WAIT_FOREVER).unwrap();
        }
        0
    });
    producer.start();

    assert_eq!(Ok(55), consumer.join());
    assert_eq!(Ok(0), producer.join());
    assert_eq!(0, record::registry().holders(RECORD));
    assert!(record::destroy(RECORD));
    assert!(!record::exists(RECORD));
}

/// A counting semaphore bounds how many workers are inside at once
#[test]
fn test_semaphore_bounds_workers() {
    let slots = Arc::new(Semaphore::new(2, 2));
    let inside = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..5)
        .map(|i| {
            let slots = slots.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            let worker = Thread::alloc(&format!("Worker{i}"), 1024, move || {
                slots.acquire(WAIT_FOREVER).unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                kernel::delay_ms(5);
                inside.fetch_sub(1, Ordering::SeqCst);
                slots.release().unwrap();
                i
            });
            worker.start();
            worker
        })
        .collect();

    for (i, worker) in workers.into_iter().enumerate() {
        assert_eq!(Ok(i as i32), worker.join());
        worker.free();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(2, slots.count());
}

/// An interrupt hands work to a thread through thread flags, and the thread answers through an
/// API lock
#[test]
fn test_isr_to_thread_handoff() {
    const WORK: u32 = 1 << 3;
    let done = ApiLock::new_locked();
    let result = Arc::new(AtomicU32::new(0));

    let worker = {
        let done = done.clone();
        let result = result.clone();
        Thread::alloc("Handler", 1024, move || {
            let flags = thread::flags_wait(WORK, FlagOptions::WAIT_ANY, WAIT_FOREVER).unwrap();
            result.store(flags, Ordering::SeqCst);
            done.unlock();
            0
        })
    };
    worker.start();

    let id = worker.id();
    kernel::run_in_isr(|| thread::flags_set(id, WORK)).unwrap();
    done.wait_unlock_and_free().unwrap();
    assert_eq!(WORK, result.load(Ordering::SeqCst) & WORK);
    assert_eq!(Ok(0), worker.join());
}

/// Mutex and event flag together: only the mutex owner may signal, waiters see every signal
#[test]
fn test_mutex_guarded_signalling() {
    let lock = Arc::new(Mutex::new(MutexKind::Recursive));
    let events = Arc::new(EventFlag::new());

    let signallers: Vec<_> = (0..3u32)
        .map(|i| {
            let lock = lock.clone();
            let events = events.clone();
            let t = Thread::alloc("Signal", 1024, move || {
                let _outer = lock.guard(WAIT_FOREVER).unwrap();
                let _inner = lock.guard(WAIT_FOREVER).unwrap();
                events.set(1 << i).unwrap();
                0
            });
            t.start();
            t
        })
        .collect();

    assert_eq!(
        Ok(0b111),
        events.wait(0b111, FlagOptions::WAIT_ALL, 1000)
    );
    assert_eq!(0, events.get());
    for t in signallers {
        t.join().unwrap();
    }
    assert_eq!(None, lock.owner());
}
