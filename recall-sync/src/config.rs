//! Engine configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the sync engine.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Device name for identification in logs.
    pub device_name: String,
    /// Quiet window cleanup waits for after a mirror refresh (ms).
    pub cleanup_debounce_ms: u64,
    /// Maximum writes sent per dispatcher pass.
    pub dispatch_batch_size: usize,
    /// First pause after the remote store was unreachable (ms).
    pub retry_backoff_ms: u64,
    /// Upper bound of the exponential pause (ms).
    pub max_backoff_ms: u64,
    /// Unreachable attempts per change that are counted in `retry_count`.
    /// Past this the change stays pending and is still retried.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: "Recall Device".to_string(),
            cleanup_debounce_ms: 250,
            dispatch_batch_size: 100,
            retry_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl SyncConfig {
    /// Parses a JSON config document.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON config file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn cleanup_debounce(&self) -> Duration {
        Duration::from_millis(self.cleanup_debounce_ms)
    }

    /// Pause before the given retry attempt (1-based): the initial backoff
    /// doubled per attempt, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms.max(self.retry_backoff_ms));
        Duration::from_millis(ms)
    }
}
