use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Tunable settings for one device connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Inactivity after which a slot is considered abandoned.
    pub transfer_timeout_ms: u64,
    /// Upper bound of one ack-per-chunk frame, header included.
    pub max_block_size: usize,
    /// Chunks a windowed upload may have in flight before the first ack.
    pub window_size: u8,
    /// Fetch directory entries whose kind is not in the supported set.
    pub fetch_unknown_files: bool,
    /// Leave files on the peer instead of marking them archived.
    pub keep_data_on_device: bool,
    /// Re-enqueue a failed descriptor once at the back of the queue.
    pub retry_failed_once: bool,
    /// MTU assumed until the transport reports the negotiated one.
    pub default_mtu: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 5_000,
            max_block_size: 500,
            window_size: 4,
            fetch_unknown_files: false,
            keep_data_on_device: false,
            retry_failed_once: false,
            default_mtu: 23,
        }
    }
}

impl SyncConfig {
    pub fn balanced() -> Self {
        Self::default()
    }

    /// Pull everything the peer lists and clear it off the device.
    pub fn archive_everything() -> Self {
        Self {
            fetch_unknown_files: true,
            keep_data_on_device: false,
            ..Self::default()
        }
    }

    /// One chunk in flight, a second attempt for every failed file.
    pub fn conservative() -> Self {
        Self {
            window_size: 1,
            retry_failed_once: true,
            keep_data_on_device: true,
            ..Self::default()
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::info!("Loading sync config from {}", path.as_ref().display());
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(crate::TransferError::Config(
                "window_size must be at least 1".to_owned(),
            ));
        }
        if self.max_block_size <= crate::frame::ACK_PER_CHUNK_MAX_HEADER {
            return Err(crate::TransferError::Config(format!(
                "max_block_size {} leaves no room for payload",
                self.max_block_size
            )));
        }
        Ok(())
    }
}
