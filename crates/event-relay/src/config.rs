//! Relay configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults. All values are plain tuning knobs; there is nothing sensitive
//! here.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default maximum deliveries per upstream pull.
pub const DEFAULT_PULL_BATCH_SIZE: usize = 64;

/// Default upstream pull wait in milliseconds.
pub const DEFAULT_PULL_TIMEOUT_MS: u64 = 500;

/// Default per-subscriber queue capacity. A subscriber whose queue fills is
/// disconnected with a `Lagged` fault rather than blocking the fan-out.
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// Default session output queue capacity.
pub const DEFAULT_SESSION_BUFFER: usize = 256;

/// Relay tuning configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum deliveries per upstream pull (default: 64).
    pub pull_batch_size: usize,

    /// How long one upstream pull waits for deliveries (default: 500ms).
    pub pull_timeout: Duration,

    /// Capacity of each subscriber queue (default: 1024).
    pub subscriber_queue_capacity: usize,

    /// Capacity of each session's merged output queue (default: 256).
    pub session_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: DEFAULT_PULL_BATCH_SIZE,
            pull_timeout: Duration::from_millis(DEFAULT_PULL_TIMEOUT_MS),
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            session_buffer: DEFAULT_SESSION_BUFFER,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that does not parse.
    #[error("Invalid value for {name}: {value}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// A value parsed but is outside its allowed range.
    #[error("Value for {name} must be greater than zero")]
    MustBePositive {
        /// Variable name.
        name: &'static str,
    },
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// Recognized variables (all optional):
    /// - `RELAY_PULL_BATCH_SIZE`
    /// - `RELAY_PULL_TIMEOUT_MS`
    /// - `RELAY_SUBSCRIBER_QUEUE_CAPACITY`
    /// - `RELAY_SESSION_BUFFER`
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a non-numeric or zero value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pull_batch_size = read_usize("RELAY_PULL_BATCH_SIZE", DEFAULT_PULL_BATCH_SIZE)?;
        let pull_timeout_ms = read_u64("RELAY_PULL_TIMEOUT_MS", DEFAULT_PULL_TIMEOUT_MS)?;
        let subscriber_queue_capacity = read_usize(
            "RELAY_SUBSCRIBER_QUEUE_CAPACITY",
            DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
        )?;
        let session_buffer = read_usize("RELAY_SESSION_BUFFER", DEFAULT_SESSION_BUFFER)?;

        Ok(Self {
            pull_batch_size,
            pull_timeout: Duration::from_millis(pull_timeout_ms),
            subscriber_queue_capacity,
            session_buffer,
        })
    }
}

fn read_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(raw) => {
            let value: usize = raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })?;
            if value == 0 {
                return Err(ConfigError::MustBePositive { name });
            }
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}

fn read_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => {
            let value: u64 = raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })?;
            if value == 0 {
                return Err(ConfigError::MustBePositive { name });
            }
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}
