//! Link configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Configuration for a link session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Advertised name of the device to bind to.
    pub device_name: String,
    /// Delay before the post-connect sync request, in milliseconds.
    pub sync_delay_ms: u64,
    pub ota: OtaConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            sync_delay_ms: SYNC_DELAY_MS,
            ota: OtaConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }
}

/// Firmware update timing and flow-control parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Wait for REQUEST_ACK, in seconds.
    pub request_timeout_secs: u64,
    /// Wait for DONE_ACK, in seconds.
    pub done_timeout_secs: u64,
    /// Wait for one credit grant, in milliseconds.
    pub credit_timeout_ms: u64,
    /// Consecutive credit timeouts before giving up.
    pub credit_timeout_ceiling: u32,
    /// Packets per credit grant. Must match the firmware.
    pub credit_batch: u32,
    pub request_settle_ms: u64,
    pub finalize_settle_ms: u64,
    /// Report progress every N packets.
    pub progress_interval: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: REQUEST_ACK_TIMEOUT_SECS,
            done_timeout_secs: DONE_ACK_TIMEOUT_SECS,
            credit_timeout_ms: CREDIT_WAIT_MS,
            credit_timeout_ceiling: CREDIT_TIMEOUT_CEILING,
            credit_batch: OTA_CREDIT_BATCH,
            request_settle_ms: REQUEST_SETTLE_MS,
            finalize_settle_ms: FINALIZE_SETTLE_MS,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl OtaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn done_timeout(&self) -> Duration {
        Duration::from_secs(self.done_timeout_secs)
    }

    pub fn credit_timeout(&self) -> Duration {
        Duration::from_millis(self.credit_timeout_ms)
    }

    pub fn request_settle(&self) -> Duration {
        Duration::from_millis(self.request_settle_ms)
    }

    pub fn finalize_settle(&self) -> Duration {
        Duration::from_millis(self.finalize_settle_ms)
    }
}
