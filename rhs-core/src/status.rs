//! Status codes returned by the OS primitives

use snafu::Snafu;

/// Error returned by the OS primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum Error {
    /// A blocking call ran out of time
    #[snafu(display("Operation timed out"))]
    Timeout,
    /// The resource was not available and no wait was requested
    #[snafu(display("Resource not available"))]
    ResourceUnavailable,
    /// An argument was out of range
    #[snafu(display("Invalid parameter"))]
    InvalidParameter,
    /// Allocation failed
    #[snafu(display("Out of memory"))]
    NoMemory,
    /// The call is not permitted from interrupt context
    #[snafu(display("Not allowed from interrupt context"))]
    NotAllowedFromInterrupt,
    /// Unspecified failure
    #[snafu(display("Unspecified error"))]
    Unspecified,
}

impl Error {
    /// The numeric status code used on the wire and in the saved log
    pub const fn code(&self) -> i32 {
        match self {
            Error::Unspecified => -1,
            Error::Timeout => -2,
            Error::ResourceUnavailable => -3,
            Error::InvalidParameter => -4,
            Error::NoMemory => -5,
            Error::NotAllowedFromInterrupt => -6,
        }
    }

    /// The error for a blocking call which did not get its resource within `timeout`
    ///
    /// A poll (timeout of zero) reports the resource as unavailable, anything else is a timeout.
    pub const fn from_timeout(timeout: u32) -> Self {
        match timeout {
            0 => Error::ResourceUnavailable,
            _ => Error::Timeout,
        }
    }
}

/// Result type of the OS primitives
pub type Result<T, E = Error> = core::result::Result<T, E>;
