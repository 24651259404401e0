//! RHS core: the RTOS abstraction layer
//!
//! This crate provides the OS services the rest of the firmware is written against:
//!
//! * Synchronization primitives: [`EventFlag`], [`Mutex`], [`MessageQueue`], [`Semaphore`] and the
//!   single use [`ApiLock`].
//! * [`Thread`]s and services, with a scrub service reaping finished threads.
//! * One shot and periodic software [`Timer`]s, run by the timer service.
//! * The [`kernel`] tick, the kernel lock, and interrupt context.
//! * The [`record`] registry, through which services publish their handles by name.
//! * The [`cli`] command registrar.
//! * A [`log`](crate::log) backend with tag filtering and a saved crash log, and crash handling
//!   in [`check`].
//!
//! # Interrupt context
//!
//! Interrupt handlers are run through [`kernel::run_in_isr`]. Inside, blocking calls are rejected:
//! waits on event flags, mutex operations and message queue calls with a non-zero timeout return
//! an error instead of blocking.
//!
//! # Timeouts
//!
//! Blocking calls take a timeout in milliseconds. [`kernel::WAIT_FOREVER`] waits until the
//! resource is available, `0` polls. A poll which fails returns
//! [`Error::ResourceUnavailable`], any other expired wait returns [`Error::Timeout`].
#![warn(missing_docs, missing_debug_implementations)]

pub mod api_lock;
pub mod check;
pub mod cli;
pub mod event_flag;
pub mod kernel;
pub mod log;
pub mod message_queue;
pub mod mutex;
pub mod record;
pub mod semaphore;
pub mod status;
pub mod thread;
pub mod timer;

pub use api_lock::ApiLock;
pub use event_flag::{EventFlag, FlagOptions};
pub use kernel::WAIT_FOREVER;
pub use message_queue::MessageQueue;
pub use mutex::{Mutex, MutexKind};
pub use semaphore::Semaphore;
pub use status::{Error, Result};
pub use thread::{Thread, ThreadPriority, ThreadState};
pub use timer::{Timer, TimerType};
