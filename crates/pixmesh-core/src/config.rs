//! Configuration management for Pixmesh.
//!
//! The transport ships sensible defaults; deployments on slow or busy
//! meshes tune the pacing and timeout knobs through a TOML file:
//!
//! ```toml
//! [network]
//! port = 256
//!
//! [transfer]
//! chunk_size = 200
//! chunk_delay_secs = 4
//! adaptive = true
//! compress = "auto"
//!
//! [timeouts]
//! transfer_secs = 60
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::receiver::{self, ReceiverConfig};
use crate::sender::{CompressMode, SendOptions, MAX_RETRIES};
use crate::{pacing, DEFAULT_CHUNK_SIZE, DEFAULT_PORT};

/// Main configuration struct for Pixmesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Timeout settings
    pub timeouts: TimeoutConfig,
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Mesh port shared by data chunks and control strings
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Datagram size budget, header included
    pub chunk_size: usize,
    /// Baseline inter-chunk delay in seconds
    pub chunk_delay_secs: u64,
    /// Let the success rate steer the delay
    pub adaptive: bool,
    /// Pin the delay to the minimum and disable adaptation
    pub fast: bool,
    /// Retry attempts per chunk
    pub max_retries: u32,
    /// Payload compression choice
    pub compress: CompressMode,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_secs: pacing::DEFAULT_CHUNK_DELAY.as_secs(),
            adaptive: true,
            fast: false,
            max_retries: MAX_RETRIES,
            compress: CompressMode::Auto,
        }
    }
}

/// Timeout configuration options, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How often the receiver sweeps its buffers
    pub stall_check_secs: u64,
    /// Silence before a missing-chunk request
    pub stall_request_secs: u64,
    /// Silence before an active buffer times out
    pub transfer_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stall_check_secs: receiver::STALL_CHECK_INTERVAL.as_secs(),
            stall_request_secs: receiver::STALL_REQUEST_TIMEOUT.as_secs(),
            transfer_secs: receiver::TRANSFER_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// values are out of range.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check all values against their permitted ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        self.send_options().validate()?;

        if self.timeouts.stall_check_secs == 0 {
            return Err(Error::InvalidConfig {
                key: "timeouts.stall_check_secs".to_string(),
                reason: "must be nonzero".to_string(),
            });
        }
        if self.timeouts.transfer_secs <= self.timeouts.stall_request_secs {
            return Err(Error::InvalidConfig {
                key: "timeouts.transfer_secs".to_string(),
                reason: format!(
                    "must exceed stall_request_secs ({})",
                    self.timeouts.stall_request_secs
                ),
            });
        }
        Ok(())
    }

    /// Sender options derived from this configuration.
    #[must_use]
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            chunk_size: self.transfer.chunk_size,
            chunk_delay: Duration::from_secs(self.transfer.chunk_delay_secs),
            adaptive: self.transfer.adaptive,
            fast: self.transfer.fast,
            max_retries: self.transfer.max_retries,
            compress: self.transfer.compress,
        }
    }

    /// Receiver tunables derived from this configuration.
    #[must_use]
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            stall_check_interval: Duration::from_secs(self.timeouts.stall_check_secs),
            stall_request_timeout: Duration::from_secs(self.timeouts.stall_request_secs),
            transfer_timeout: Duration::from_secs(self.timeouts.transfer_secs),
            ..ReceiverConfig::default()
        }
    }
}
