//! SDO client transactions
//!
//! One transaction runs at a time per app. The caller takes the SDO mutex, starts the transfer in
//! the stack and waits on the SDO event. The stack completes the transfer from the service thread
//! while dispatching the response, which only records the outcome and releases the caller. The
//! caller's callback then runs on the calling thread with no lock held, so it may use the object
//! dictionary. When no response arrives in time the stack's SDO lines are reset so the next
//! transaction starts from a clean state.

use std::sync::{Mutex, MutexGuard, PoisonError};

use defmt_or_log::{debug, error, warn};
use rhs_common::sdo::{RawAbortCode, SdoTransfer, TransferState};
use rhs_core::{
    event_flag::FlagOptions,
    kernel::{get_tick, WAIT_FOREVER},
    rhs_crash,
};
use snafu::Snafu;

use crate::app::CanOpenApp;
use crate::object_dict::{lock_od, ObjectDictionary, OdValue, SdoCompletion, SharedOd};

const EVENT_FLAG_SDO: u32 = 1 << 0;

/// Error returned by SDO transactions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum SdoError {
    /// The stack refused to start the transfer
    #[snafu(display("SDO transfer rejected by the stack with code {code}"))]
    Rejected {
        /// The stack's error code
        code: u8,
    },
    /// The remote node did not answer in time
    #[snafu(display("SDO transfer timed out"))]
    TimedOut,
    /// The transfer was aborted, by the remote node or by the stack
    #[snafu(display("Received abort accessing object 0x{index:X}sub{sub}: {abort_code}"))]
    Aborted {
        /// Index of the aborted access
        index: u16,
        /// Sub index of the aborted access
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// An upload returned a different number of bytes than the requested type holds
    #[snafu(display("Expected {expected} bytes, received {received}"))]
    UnexpectedSize {
        /// Size of the requested type
        expected: usize,
        /// Size of the received data
        received: usize,
    },
}

enum SdoOutcome {
    Completed(SdoTransfer),
    Aborted(SdoTransfer),
}

/// Bookkeeping of the transaction in flight
#[derive(Default)]
pub(crate) struct SdoState {
    generation: u64,
    outcome: Option<SdoOutcome>,
}

fn lock_sdo(sdo: &Mutex<SdoState>) -> MutexGuard<'_, SdoState> {
    sdo.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

impl CanOpenApp {
    /// Read `index`/`sub` from a remote node
    ///
    /// Blocks until the transfer finishes, is aborted, or the SDO timeout expires. `callback` is
    /// invoked once, on the calling thread, with the finished transfer, and is not invoked when an
    /// error is returned. The finished transfer is also returned.
    pub fn read_sdo(
        &self,
        od: &SharedOd,
        node_id: u8,
        index: u16,
        sub: u8,
        callback: impl FnOnce(&SdoTransfer),
    ) -> Result<SdoTransfer, SdoError> {
        self.transaction(
            od,
            Direction::Read,
            node_id,
            index,
            sub,
            callback,
            |od, completion| od.read_network_dict(node_id, index, sub, completion),
        )
    }

    /// Write `data` to `index`/`sub` on a remote node
    ///
    /// Blocks like [`CanOpenApp::read_sdo`].
    pub fn write_sdo(
        &self,
        od: &SharedOd,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        callback: impl FnOnce(&SdoTransfer),
    ) -> Result<SdoTransfer, SdoError> {
        self.transaction(
            od,
            Direction::Write,
            node_id,
            index,
            sub,
            callback,
            |od, completion| od.write_network_dict(node_id, index, sub, data, completion),
        )
    }

    /// Read a typed value from a remote node
    pub fn read_sdo_value<T: OdValue>(
        &self,
        od: &SharedOd,
        node_id: u8,
        index: u16,
        sub: u8,
    ) -> Result<T, SdoError> {
        let transfer = self.read_sdo(od, node_id, index, sub, |_| {})?;
        T::from_le_slice(transfer.data()).ok_or(SdoError::UnexpectedSize {
            expected: T::SIZE,
            received: transfer.count,
        })
    }

    /// Write a typed value to a remote node
    pub fn write_sdo_value<T: OdValue>(
        &self,
        od: &SharedOd,
        node_id: u8,
        index: u16,
        sub: u8,
        value: T,
    ) -> Result<(), SdoError> {
        self.write_sdo(od, node_id, index, sub, &value.to_le_vec(), |_| {})
            .map(|_| ())
    }

    #[allow(clippy::too_many_arguments)]
    fn transaction(
        &self,
        od: &SharedOd,
        direction: Direction,
        node_id: u8,
        index: u16,
        sub: u8,
        callback: impl FnOnce(&SdoTransfer),
        start: impl FnOnce(&mut dyn ObjectDictionary, SdoCompletion) -> Result<(), u8>,
    ) -> Result<SdoTransfer, SdoError> {
        let _guard = match self.sdo_mutex.guard(WAIT_FOREVER) {
            Ok(guard) => guard,
            Err(e) => rhs_crash!("Failed to take the SDO mutex: {e}"),
        };

        let generation = {
            let mut sdo = lock_sdo(&self.sdo);
            sdo.generation = sdo.generation.wrapping_add(1);
            sdo.outcome = None;
            // A completion which raced the previous timeout may have left the event set
            self.sdo_event.clear(EVENT_FLAG_SDO).ok();
            sdo.generation
        };

        let time = get_tick();
        let app = self.weak();
        let completion: SdoCompletion = Box::new(move |transfer: &SdoTransfer| {
            if let Some(app) = app.upgrade() {
                app.sdo_complete(generation, transfer);
            }
        });

        let started = start(&mut *lock_od(od), completion);
        let result = match started {
            Err(code) => Err(SdoError::Rejected { code }),
            Ok(()) => {
                // Claim the outcome and retire the generation under one lock, whatever ended the
                // wait. A later completion sees a stale generation.
                let waited = self.sdo_event.wait(
                    EVENT_FLAG_SDO,
                    FlagOptions::WAIT_ANY,
                    self.config.sdo_timeout_ms,
                );
                let outcome = {
                    let mut sdo = lock_sdo(&self.sdo);
                    sdo.generation = sdo.generation.wrapping_add(1);
                    sdo.outcome.take()
                };
                match outcome {
                    Some(SdoOutcome::Completed(transfer)) => {
                        callback(&transfer);
                        return Ok(transfer);
                    }
                    Some(SdoOutcome::Aborted(transfer)) => {
                        return Err(SdoError::Aborted {
                            index: transfer.index,
                            sub: transfer.sub_index,
                            abort_code: transfer.raw_abort_code(),
                        })
                    }
                    None => {
                        if waited.is_ok() {
                            debug!("SDO event without an outcome");
                        }
                        Err(SdoError::TimedOut)
                    }
                }
            }
        };

        lock_od(od).reset_sdo();
        let code = match result {
            Err(SdoError::Rejected { code }) => code as i32,
            _ => -1,
        };
        error!(
            "SDO {} in {} error {} for 0x{:02X}, i=0x{:04X} s=0x{:02X}",
            direction, time, code, node_id, index, sub
        );
        result
    }

    /// Completion of a transfer, called by the stack from the service thread
    ///
    /// Runs with the dictionary locked, so it only records the outcome. The generation check and
    /// the event both happen under the state lock, so a completion can never release a transaction
    /// it does not belong to.
    fn sdo_complete(&self, generation: u64, transfer: &SdoTransfer) {
        let mut sdo = lock_sdo(&self.sdo);
        if sdo.generation != generation {
            debug!(
                "Ignoring late SDO completion for 0x{:02X}, i=0x{:04X} s=0x{:02X}",
                transfer.node_id, transfer.index, transfer.sub_index
            );
            return;
        }

        if transfer.state.is_aborted() {
            if transfer.state == TransferState::AbortedRcv {
                warn!(
                    "node 0x{:02X} index 0x{:04X} sub 0x{:02X} response 0x{:08X}",
                    transfer.node_id, transfer.index, transfer.sub_index, transfer.abort_code
                );
            }
            sdo.outcome = Some(SdoOutcome::Aborted(*transfer));
        } else {
            sdo.outcome = Some(SdoOutcome::Completed(*transfer));
        }
        self.sdo_event.set(EVENT_FLAG_SDO).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use assertables::assert_ok;
    use rhs_common::sdo::AbortCode;

    use super::*;
    use crate::app::tests::{app_with_od, ManualOd};
    use crate::config::CanOpenConfig;

    fn short_timeout() -> CanOpenConfig {
        CanOpenConfig {
            sdo_timeout_ms: 100,
            ..Default::default()
        }
    }

    /// Run `f` on the calling thread once the stack holds a pending transfer
    fn when_pending(od: &Arc<Mutex<ManualOd>>, count: usize, f: impl FnOnce(&mut ManualOd)) {
        for _ in 0..200 {
            {
                let mut od = od.lock().unwrap();
                if od.pending.len() >= count {
                    f(&mut od);
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("transfer never started");
    }

    #[test]
    fn test_read_completes_and_calls_back_once() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();
        let calls = Arc::new(AtomicUsize::new(0));

        let reader = {
            let app = app.clone();
            let calls = calls.clone();
            std::thread::spawn(move || {
                app.read_sdo(&shared, 5, 0x1018, 1, move |t| {
                    assert_eq!(&[0x78, 0x56, 0x34, 0x12], t.data());
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        when_pending(&od, 1, |od| {
            od.complete_next(|index, sub| {
                SdoTransfer::finished(5, index, sub, &[0x78, 0x56, 0x34, 0x12])
            })
        });

        let transfer = reader.join().unwrap().unwrap();
        assert_eq!(0x1018, transfer.index);
        assert_eq!(1, transfer.sub_index);
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(0, od.lock().unwrap().resets);
    }

    #[test]
    fn test_timeout_resets_stack() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();
        let start = std::time::Instant::now();
        let result = app.read_sdo(&shared, 5, 0x1000, 0, |_| panic!("no callback expected"));
        assert_eq!(Err(SdoError::TimedOut), result);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(1, od.lock().unwrap().resets);
    }

    #[test]
    fn test_rejected_start() {
        let (app, od) = app_with_od(short_timeout());
        od.lock().unwrap().reject = Some(3);
        let shared: SharedOd = od.clone();
        assert_eq!(
            Err(SdoError::Rejected { code: 3 }),
            app.write_sdo(&shared, 5, 0x2000, 0, &[1], |_| {})
        );
        assert_eq!(1, od.lock().unwrap().resets);
    }

    #[test]
    fn test_abort_returns_code() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();
        let writer = {
            let app = app.clone();
            std::thread::spawn(move || {
                app.write_sdo_value(&shared, 5, 0x2000, 0, 7u8)
            })
        };
        when_pending(&od, 1, |od| {
            od.complete_next(|index, sub| {
                SdoTransfer::aborted(
                    5,
                    index,
                    sub,
                    TransferState::AbortedRcv,
                    AbortCode::ReadOnly as u32,
                )
            })
        });
        assert_eq!(
            Err(SdoError::Aborted {
                index: 0x2000,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::ReadOnly),
            }),
            writer.join().unwrap()
        );
        assert_eq!(vec![(0x2000, 0, vec![7])], od.lock().unwrap().written);
    }

    #[test]
    fn test_late_completion_ignored() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();

        // The first transfer times out but the stack keeps its completion
        assert_eq!(
            Err(SdoError::TimedOut),
            app.read_sdo(&shared, 5, 0x1000, 0, |_| panic!("stale callback"))
        );

        let reader = {
            let app = app.clone();
            std::thread::spawn(move || app.read_sdo_value::<u16>(&shared, 5, 0x1017, 0))
        };
        when_pending(&od, 2, |od| {
            // Stale completion for the first transfer
            od.complete_next(|index, sub| SdoTransfer::finished(5, index, sub, &[9, 9, 9, 9]));
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(!reader.is_finished());
        when_pending(&od, 1, |od| {
            od.complete_next(|index, sub| SdoTransfer::finished(5, index, sub, &[0xE8, 0x03]));
        });
        assert_eq!(Ok(1000u16), reader.join().unwrap());
    }

    #[test]
    fn test_completion_after_timeout_is_dropped() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();
        let calls = Arc::new(AtomicUsize::new(0));

        let reader = {
            let app = app.clone();
            let calls = calls.clone();
            std::thread::spawn(move || {
                app.read_sdo(&shared, 5, 0x1018, 1, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        // The stack answers only after the wait expired, while the caller is still waiting for
        // the dictionary to reset the line
        when_pending(&od, 1, |od| {
            std::thread::sleep(Duration::from_millis(250));
            od.complete_next(|index, sub| SdoTransfer::finished(5, index, sub, &[1, 2, 3, 4]));
        });

        assert_eq!(Err(SdoError::TimedOut), reader.join().unwrap());
        assert_eq!(0, calls.load(Ordering::SeqCst));
        assert_eq!(1, od.lock().unwrap().resets);
    }

    #[test]
    fn test_callback_may_use_dictionary() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();

        let reader = {
            let app = app.clone();
            let shared = shared.clone();
            std::thread::spawn(move || {
                let target = shared.clone();
                app.read_sdo(&shared, 5, 0x1017, 0, move |t| {
                    lock_od(&target)
                        .set_od_entry(0x2100, 0, t.data())
                        .unwrap();
                })
            })
        };
        when_pending(&od, 1, |od| {
            od.complete_next(|index, sub| SdoTransfer::finished(5, index, sub, &[0xE8, 0x03]));
        });

        assert_ok!(reader.join().unwrap());
        assert_eq!(
            Ok(1000u16),
            crate::object_dict::od_get_field::<u16>(&shared, 0x2100, 0)
        );
    }

    #[test]
    fn test_typed_read_size_mismatch() {
        let (app, od) = app_with_od(short_timeout());
        let shared: SharedOd = od.clone();
        let reader = {
            let app = app.clone();
            std::thread::spawn(move || app.read_sdo_value::<u32>(&shared, 5, 0x1017, 0))
        };
        when_pending(&od, 1, |od| {
            od.complete_next(|index, sub| SdoTransfer::finished(5, index, sub, &[0xE8, 0x03]));
        });
        assert_eq!(
            Err(SdoError::UnexpectedSize {
                expected: 4,
                received: 2
            }),
            reader.join().unwrap()
        );
    }
}
