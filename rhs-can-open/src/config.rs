//! Service configuration
//!
//! The defaults match the firmware build. A board may override any of them from a TOML file:
//!
//! ```toml
//! sdo_timeout_ms = 500
//! tx_attempts = 5
//! ```

use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Time to wait for an SDO transfer to complete
pub const SDO_TIMEOUT_MS: u32 = 1000;
/// Default length of the RX and TX queues
pub const QUEUE_LEN: usize = 32;
/// Number of attempts made to hand a frame to the controller
pub const TX_ATTEMPTS: u8 = 3;
/// Delay between transmit attempts
pub const TX_RETRY_DELAY_MS: u32 = 1;

/// Error returned when loading a [`CanOpenConfig`]
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("IO error reading {path}: {source}"))]
    Io {
        /// The file which was read
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML, or holds unknown keys
    #[snafu(display("Error parsing CAN-open config: {source}"))]
    Parse {
        /// The underlying error
        source: toml::de::Error,
    },
    /// A value is out of range
    #[snafu(display("Invalid CAN-open config: {message}"))]
    InvalidValue {
        /// What is wrong with the value
        message: String,
    },
}

/// Tunables of the CAN-open service
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CanOpenConfig {
    /// How long an SDO transaction waits for the remote node
    pub sdo_timeout_ms: u32,
    /// Capacity of the RX queue between the receive interrupt and the service
    pub rx_queue_len: usize,
    /// Capacity of the TX queue between the stack and the service
    pub tx_queue_len: usize,
    /// Number of transmit attempts before a frame is dropped
    pub tx_attempts: u8,
    /// Delay between transmit attempts
    pub tx_retry_delay_ms: u32,
}

impl Default for CanOpenConfig {
    fn default() -> Self {
        Self {
            sdo_timeout_ms: SDO_TIMEOUT_MS,
            rx_queue_len: QUEUE_LEN,
            tx_queue_len: QUEUE_LEN,
            tx_attempts: TX_ATTEMPTS,
            tx_retry_delay_ms: TX_RETRY_DELAY_MS,
        }
    }
}

impl CanOpenConfig {
    /// Parse a configuration from a TOML string
    ///
    /// Keys which are not present keep their default value.
    pub fn load_from_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Self::load_from_str(&s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rx_queue_len == 0 || self.tx_queue_len == 0 {
            return InvalidValueSnafu {
                message: "queue lengths must be non-zero",
            }
            .fail();
        }
        if self.tx_attempts == 0 {
            return InvalidValueSnafu {
                message: "tx_attempts must be at least 1",
            }
            .fail();
        }
        Ok(())
    }
}
