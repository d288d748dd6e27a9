// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Governs how the queue replays its head command against the remote. The
//! default never gives up: a failing head command blocks everything behind
//! it, preserving FIFO order. A bounded policy lets the drain loop report a
//! stall instead.
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Replay: never give up on the head command
//! let replay = RetryConfig::replay();
//! assert_eq!(replay.max_retries, None);
//!
//! // Bounded: report a stall after 5 attempts
//! let bounded = RetryConfig::bounded(5);
//! assert_eq!(bounded.max_retries, Some(5));
//! assert_eq!(bounded.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use super::shutdown::Shutdown;

/// Configuration for operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::replay()
    }
}

impl RetryConfig {
    /// Infinite retry for queue replay.
    /// Backoff starts at 100ms and is capped at 30 seconds.
    #[must_use]
    pub fn replay() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Same backoff as [`replay`](Self::replay) but gives up after
    /// `max_retries` attempts.
    #[must_use]
    pub fn bounded(max_retries: usize) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::replay()
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay following `delay`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("retry cancelled")]
    Cancelled,
}

/// Run `operation` until it succeeds, the policy is exhausted, or
/// `shutdown` fires. Cancellation is observed before every attempt and
/// cuts a backoff sleep short.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    shutdown: &Shutdown,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        if shutdown.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => {
                        return Err(RetryError::Exhausted { attempts, last: err });
                    }
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
                }
                delay = config.next_delay(delay);
            }
        }
    }
}
