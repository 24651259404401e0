//! Tagged, leveled logger and the saved log
//!
//! [`RhsLogger`] implements [`log::Log`]. The `log` target is used as the tag, so a message from
//! `log::warn!(target: "CanOpen", ...)` prints as
//!
//! ```text
//! 1234:	[CanOpen]:	CAN 1 is stopped
//! ```
//!
//! The saved log keeps the last [`MAX_LOG_COUNT`] crash messages, each truncated to
//! [`MAX_LOG_LENGTH`] bytes, so they can be read back after a reset.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use heapless::{Deque, String, Vec};

use crate::kernel::get_tick;
use crate::status::{Error, Result};

/// Maximum number of excluded tags
pub const MAX_TAG_COUNT: usize = 32;
/// Maximum length of an excluded tag
pub const MAX_TAG_LENGTH: usize = 16;
/// Number of messages held by the saved log
pub const MAX_LOG_COUNT: usize = 16;
/// Maximum length of one saved message
pub const MAX_LOG_LENGTH: usize = 120;

/// Verbosity of the logger
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Reset to the default level ([`LogLevel::Debug`])
    Default = 0,
    /// Print nothing
    None = 1,
    /// Errors only
    Error = 2,
    /// Warnings and errors
    Warn = 3,
    /// Informational messages and above
    Info = 4,
    /// Debug messages and above
    Debug = 5,
    /// Everything
    Trace = 6,
}

const DEFAULT_LEVEL: LogLevel = LogLevel::Debug;

impl LogLevel {
    fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Default => DEFAULT_LEVEL.to_filter(),
            LogLevel::None => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

type Tag = String<MAX_TAG_LENGTH>;
type SavedMessage = String<MAX_LOG_LENGTH>;

struct LogState {
    level: LogLevel,
    excluded: Vec<Tag, MAX_TAG_COUNT>,
}

static STATE: Mutex<RefCell<LogState>> = Mutex::new(RefCell::new(LogState {
    level: DEFAULT_LEVEL,
    excluded: Vec::new(),
}));

static SAVED: Mutex<RefCell<Deque<SavedMessage, MAX_LOG_COUNT>>> =
    Mutex::new(RefCell::new(Deque::new()));

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// The RHS log backend
#[derive(Debug, Clone, Copy, Default)]
pub struct RhsLogger;

static LOGGER: RhsLogger = RhsLogger;

impl RhsLogger {
    fn passes(&self, level: log::Level, tag: &str) -> bool {
        critical_section::with(|cs| {
            let state = STATE.borrow_ref(cs);
            level <= state.level.to_filter() && !state.excluded.iter().any(|t| t.as_str() == tag)
        })
    }
}

impl log::Log for RhsLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.passes(metadata.level(), metadata.target())
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("{}:\t[{}]:\t{}", get_tick(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install [`RhsLogger`] as the global logger
///
/// Does nothing if a logger is already installed, e.g. `env_logger` in tests.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        INSTALLED.store(true, Ordering::Release);
        log::set_max_level(level().to_filter());
    }
}

/// Set the log level
pub fn set_level(level: LogLevel) {
    let level = match level {
        LogLevel::Default => DEFAULT_LEVEL,
        l => l,
    };
    critical_section::with(|cs| STATE.borrow_ref_mut(cs).level = level);
    if INSTALLED.load(Ordering::Acquire) {
        log::set_max_level(level.to_filter());
    }
}

/// Get the current log level
pub fn level() -> LogLevel {
    critical_section::with(|cs| STATE.borrow_ref(cs).level)
}

/// Suppress all messages with the given tag
///
/// Fails with `InvalidParameter` if the tag is longer than [`MAX_TAG_LENGTH`], and with `NoMemory`
/// when [`MAX_TAG_COUNT`] tags are already excluded.
pub fn exclude_tag(tag: &str) -> Result<()> {
    let tag = Tag::try_from(tag).map_err(|_| Error::InvalidParameter)?;
    critical_section::with(|cs| {
        let mut state = STATE.borrow_ref_mut(cs);
        if state.excluded.contains(&tag) {
            return Ok(());
        }
        state.excluded.push(tag).map_err(|_| Error::NoMemory)
    })
}

/// Remove a tag from the excluded list
pub fn unexclude_tag(tag: &str) {
    critical_section::with(|cs| {
        STATE
            .borrow_ref_mut(cs)
            .excluded
            .retain(|t| t.as_str() != tag)
    });
}

/// Truncate `s` to at most `max` bytes on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Append a message to the saved log
///
/// Once the log holds [`MAX_LOG_COUNT`] messages the oldest one is dropped.
pub fn save(message: &str) {
    let mut entry = SavedMessage::new();
    // Cannot fail, the input was cut to capacity
    entry.push_str(truncate(message, MAX_LOG_LENGTH)).ok();
    critical_section::with(|cs| {
        let mut saved = SAVED.borrow_ref_mut(cs);
        if saved.is_full() {
            saved.pop_front();
        }
        saved.push_back(entry).ok();
    });
}

/// Read saved message `index`, oldest first
pub fn read_saved(index: usize) -> Option<std::string::String> {
    critical_section::with(|cs| {
        SAVED
            .borrow_ref(cs)
            .iter()
            .nth(index)
            .map(|s| s.as_str().to_owned())
    })
}

/// Number of messages in the saved log
pub fn count_saved() -> usize {
    critical_section::with(|cs| SAVED.borrow_ref(cs).len())
}

/// Clear the saved log
pub fn erase_saved() {
    critical_section::with(|cs| SAVED.borrow_ref_mut(cs).clear());
}

#[cfg(test)]
mod tests {
    use log::Log;

    use super::*;

    #[test]
    #[serial_test::serial(saved_log)]
    fn test_saved_log_drops_oldest() {
        erase_saved();
        for i in 0..MAX_LOG_COUNT + 3 {
            save(&format!("message {i}"));
        }
        assert_eq!(MAX_LOG_COUNT, count_saved());
        assert_eq!(Some("message 3".to_string()), read_saved(0));
        assert_eq!(
            Some(format!("message {}", MAX_LOG_COUNT + 2)),
            read_saved(MAX_LOG_COUNT - 1)
        );
        assert_eq!(None, read_saved(MAX_LOG_COUNT));
        erase_saved();
        assert_eq!(0, count_saved());
    }

    #[test]
    #[serial_test::serial(saved_log)]
    fn test_saved_log_truncates() {
        erase_saved();
        let long = "é".repeat(MAX_LOG_LENGTH);
        save(&long);
        let stored = read_saved(0).unwrap();
        assert!(stored.len() <= MAX_LOG_LENGTH);
        assert!(long.starts_with(&stored));
        erase_saved();
    }

    #[test]
    #[serial_test::serial(log_state)]
    fn test_level_and_tags() {
        let logger = RhsLogger;
        set_level(LogLevel::Warn);
        assert_eq!(LogLevel::Warn, level());
        let meta = |level, target| log::Metadata::builder().level(level).target(target).build();
        assert!(logger.enabled(&meta(log::Level::Error, "Test")));
        assert!(!logger.enabled(&meta(log::Level::Info, "Test")));

        exclude_tag("Noisy").unwrap();
        assert!(!logger.enabled(&meta(log::Level::Error, "Noisy")));
        unexclude_tag("Noisy");
        assert!(logger.enabled(&meta(log::Level::Error, "Noisy")));

        assert_eq!(
            Err(Error::InvalidParameter),
            exclude_tag("a_tag_which_is_too_long")
        );

        set_level(LogLevel::Default);
        assert_eq!(LogLevel::Debug, level());
    }
}
