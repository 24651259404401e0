//! Crash handling for irrecoverable conditions
//!
//! A crash records the message and its location in the saved log, logs it under the `Assert` tag
//! and then panics. On the host, the panic stands in for the reset performed on hardware.

use std::panic::Location;

use crate::kernel::get_tick;

/// Record a fatal error and abort the current thread
#[track_caller]
#[cold]
pub fn crash(message: &str) -> ! {
    let location = Location::caller();
    let file = location
        .file()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(location.file());
    crate::log::save(&format!(
        "{}: Message: {}. file: {}, line: {};",
        get_tick(),
        message,
        file,
        location.line()
    ));
    log::error!(
        target: "Assert",
        "Message: {}. Called from file: {}, line: {}",
        message,
        file,
        location.line()
    );
    panic!("{message}");
}

/// Crash with a message
#[macro_export]
macro_rules! rhs_crash {
    ($($arg:tt)+) => {
        $crate::check::crash(&format!($($arg)+))
    };
}

/// Crash if a condition does not hold
#[macro_export]
macro_rules! rhs_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::check::crash(concat!("assertion failed: ", stringify!($cond)))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::check::crash(&format!($($arg)+))
        }
    };
}
