use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use integration_tests::mock_od::ERR_TOO_LONG;
use integration_tests::prelude::*;
use rhs_can_open::lock_od;
use rhs_common::sdo::{RawAbortCode, SdoTransfer, TransferState};

fn short_timeout() -> CanOpenConfig {
    CanOpenConfig {
        sdo_timeout_ms: 50,
        ..Default::default()
    }
}

#[test]
fn test_sdo_read() {
    let bench = TestBench::new(CanOpenConfig::default());
    let od = bench.shared_od();
    bench.remote.set_entry(0x1018, 1, &[0x78, 0x56, 0x34, 0x12]);

    let calls = Arc::new(AtomicUsize::new(0));
    let transfer = {
        let calls = calls.clone();
        bench
            .app
            .read_sdo(&od, REMOTE_NODE, 0x1018, 1, move |t: &SdoTransfer| {
                assert_eq!(0x1018, t.index);
                calls.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
    };
    assert_eq!(TransferState::Finished, transfer.state);
    assert_eq!(REMOTE_NODE, transfer.node_id);
    assert_eq!(&[0x78, 0x56, 0x34, 0x12], transfer.data());
    assert_eq!(1, calls.load(Ordering::Relaxed));

    assert_eq!(
        Ok(0x1234_5678u32),
        bench.app.read_sdo_value::<u32>(&od, REMOTE_NODE, 0x1018, 1)
    );
    assert!(!bench.od().sdo_in_progress());
}

#[test]
fn test_sdo_write() {
    let bench = TestBench::new(CanOpenConfig::default());
    let od = bench.shared_od();
    bench.remote.set_entry(0x2000, 1, &[0, 0]);

    bench
        .app
        .write_sdo_value(&od, REMOTE_NODE, 0x2000, 1, 0xBEEFu16)
        .unwrap();
    assert_eq!(Some(vec![0xEF, 0xBE]), bench.remote.entry(0x2000, 1));

    let transfer = bench
        .app
        .write_sdo(&od, REMOTE_NODE, 0x2000, 1, &[1], |_| {})
        .unwrap();
    assert_eq!(TransferState::Finished, transfer.state);
    assert_eq!(Some(vec![1]), bench.remote.entry(0x2000, 1));
}

/// The callback stores the value in the local dictionary, which the service thread also uses
#[test]
fn test_sdo_read_into_local_entry() {
    let bench = TestBench::new(short_timeout());
    let od = bench.shared_od();
    bench.remote.set_entry(0x1017, 0, &[0xE8, 0x03]);

    let local = od.clone();
    let transfer = bench
        .app
        .read_sdo(&od, REMOTE_NODE, 0x1017, 0, move |t: &SdoTransfer| {
            lock_od(&local).set_od_entry(0x2001, 0, t.data()).unwrap();
        })
        .unwrap();
    assert_eq!(TransferState::Finished, transfer.state);
    assert_eq!(Some(&[0xE8u8, 0x03][..]), bench.od().entry(0x2001, 0));
}

#[test]
fn test_sdo_abort() {
    let bench = TestBench::new(CanOpenConfig::default());
    let od = bench.shared_od();

    let calls = Arc::new(AtomicUsize::new(0));
    let result = {
        let calls = calls.clone();
        bench
            .app
            .read_sdo(&od, REMOTE_NODE, 0x3000, 2, move |_: &SdoTransfer| {
                calls.fetch_add(1, Ordering::Relaxed);
            })
    };
    assert_eq!(
        Err(SdoError::Aborted {
            index: 0x3000,
            sub: 2,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject),
        }),
        result
    );
    assert_eq!(0, calls.load(Ordering::Relaxed));
    assert!(!bench.od().sdo_in_progress());
}

#[test]
fn test_sdo_timeout_then_recover() {
    let bench = TestBench::new(short_timeout());
    let od = bench.shared_od();
    bench.remote.set_entry(0x1000, 0, &[0x91, 0x01, 0x0F, 0x00]);
    bench.remote.set_silent(true);

    assert_eq!(
        Err(SdoError::TimedOut),
        bench.app.read_sdo(&od, REMOTE_NODE, 0x1000, 0, |_| {})
    );
    assert_eq!(1, bench.remote.requests());
    assert!(!bench.od().sdo_in_progress());
    assert_eq!(Some(&SdoEvent::Reset), bench.od().sdo_events().last());

    bench.remote.set_silent(false);
    assert_eq!(
        Ok(0x000F_0191u32),
        bench.app.read_sdo_value::<u32>(&od, REMOTE_NODE, 0x1000, 0)
    );
}

#[test]
fn test_sdo_rejected_by_stack() {
    let bench = TestBench::new(CanOpenConfig::default());
    let od = bench.shared_od();
    assert_eq!(
        Err(SdoError::Rejected { code: ERR_TOO_LONG }),
        bench
            .app
            .write_sdo(&od, REMOTE_NODE, 0x2000, 0, &[1, 2, 3, 4, 5], |_| {})
    );
    assert_eq!(0, bench.remote.requests());
}

#[test]
fn test_sdo_typed_size_mismatch() {
    let bench = TestBench::new(CanOpenConfig::default());
    let od = bench.shared_od();
    bench.remote.set_entry(0x1017, 0, &[0xE8, 0x03]);
    assert_eq!(
        Err(SdoError::UnexpectedSize {
            expected: 4,
            received: 2
        }),
        bench.app.read_sdo_value::<u32>(&od, REMOTE_NODE, 0x1017, 0)
    );
    assert_eq!(
        Ok(1000u16),
        bench.app.read_sdo_value::<u16>(&od, REMOTE_NODE, 0x1017, 0)
    );
}

/// Concurrent callers are served one transfer at a time
#[test]
fn test_sdo_transfers_are_serialized() {
    let bench = Arc::new(TestBench::new(CanOpenConfig::default()));
    for i in 0..4u16 {
        bench.remote.set_entry(0x2100 + i, 0, &[i as u8]);
    }

    let workers: Vec<_> = (0..4u16)
        .map(|i| {
            let bench = bench.clone();
            std::thread::spawn(move || {
                let od = bench.shared_od();
                bench
                    .app
                    .read_sdo_value::<u8>(&od, REMOTE_NODE, 0x2100 + i, 0)
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        assert_eq!(Ok(i as u8), worker.join().unwrap());
    }

    let events = bench.od().sdo_events().to_vec();
    assert_eq!(8, events.len());
    for pair in events.chunks(2) {
        match pair {
            [SdoEvent::Started { index: a }, SdoEvent::Completed { index: b }] => {
                assert_eq!(a, b)
            }
            other => panic!("Transfers overlapped: {other:?}"),
        }
    }
}
