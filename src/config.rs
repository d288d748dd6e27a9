//! Configuration for the offline sync engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::OfflineSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = OfflineSyncConfig::default();
//! assert_eq!(config.cache_max_bytes, 5 * 1024 * 1024); // 5 MB
//! assert_eq!(config.replay_max_retries, None); // retry forever
//!
//! // Tuned config
//! let config = OfflineSyncConfig {
//!     cache_max_bytes: 1024 * 1024,
//!     replay_max_retries: Some(10),
//!     ..Default::default()
//! };
//! assert_eq!(config.replay_retry().max_retries, Some(10));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::key_path::KeyPath;
use crate::resilience::retry::RetryConfig;

/// Configuration for the offline sync engine.
///
/// All fields have defaults, so an empty document deserializes.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineSyncConfig {
    /// Local cache budget in bytes (default: 5 MB)
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Address of the durable command log
    #[serde(default = "default_queue_key_path")]
    pub queue_key_path: Vec<String>,

    /// First replay backoff delay
    #[serde(default = "default_replay_initial_delay_ms")]
    pub replay_initial_delay_ms: u64,

    /// Replay backoff cap
    #[serde(default = "default_replay_max_delay_ms")]
    pub replay_max_delay_ms: u64,

    /// Attempts before the queue reports a stall (`None` = never)
    #[serde(default)]
    pub replay_max_retries: Option<usize>,

    /// Buffered events per broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_cache_max_bytes() -> usize { 5 * 1024 * 1024 } // 5 MB
fn default_queue_key_path() -> Vec<String> { vec!["meta".into(), "storageQueue".into()] }
fn default_replay_initial_delay_ms() -> u64 { 100 }
fn default_replay_max_delay_ms() -> u64 { 30_000 }
fn default_event_capacity() -> usize { 256 }

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: default_cache_max_bytes(),
            queue_key_path: default_queue_key_path(),
            replay_initial_delay_ms: default_replay_initial_delay_ms(),
            replay_max_delay_ms: default_replay_max_delay_ms(),
            replay_max_retries: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl OfflineSyncConfig {
    /// Retry policy for the replay loop.
    #[must_use]
    pub fn replay_retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.replay_initial_delay_ms),
            max_delay: Duration::from_millis(self.replay_max_delay_ms),
            factor: 2.0,
            max_retries: self.replay_max_retries,
        }
    }

    #[must_use]
    pub fn queue_key_path(&self) -> KeyPath {
        KeyPath::new(self.queue_key_path.clone())
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_max_bytes == 0 {
            return Err("cache_max_bytes must be > 0".into());
        }
        if self.queue_key_path.is_empty() {
            return Err("queue_key_path must not be empty".into());
        }
        if self.replay_initial_delay_ms > self.replay_max_delay_ms {
            return Err("replay_initial_delay_ms must be <= replay_max_delay_ms".into());
        }
        if self.replay_max_retries == Some(0) {
            return Err("replay_max_retries must be > 0 when set".into());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be > 0".into());
        }
        Ok(())
    }
}
