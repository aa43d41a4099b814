use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configures retry waits, timeouts and connection cleanup.
///
/// Deserializes from partial documents: missing fields take the
/// [`ClientOptions::single_host`] values.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Lower bound handed to the wait strategy, in milliseconds.
    pub retry_wait_min_ms: u64,
    /// Upper bound handed to the wait strategy, in milliseconds.
    pub retry_wait_max_ms: u64,
    /// Per-attempt transport timeout and overall call budget, in milliseconds.
    /// `0` disables both.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Bytes read from a discarded response body before it is dropped.
    pub response_drain_limit: u64,
    /// Close idle pooled connections whenever a call finishes.
    pub kill_idle_connections: bool,
}

impl ClientOptions {
    /// Settings for repeatedly calling a single host; idle connections are kept.
    pub fn single_host() -> Self {
        Self {
            retry_wait_min_ms: 1_000,
            retry_wait_max_ms: 30_000,
            timeout_ms: 30_000,
            max_retries: 5,
            response_drain_limit: 4_096,
            kill_idle_connections: false,
        }
    }

    /// Settings for calling many hosts once each; idle connections are closed.
    pub fn host_spraying() -> Self {
        Self {
            kill_idle_connections: true,
            ..Self::single_host()
        }
    }

    /// Shortest wait between attempts.
    pub fn retry_wait_min(&self) -> Duration {
        Duration::from_millis(self.retry_wait_min_ms)
    }

    /// Longest wait between attempts.
    pub fn retry_wait_max(&self) -> Duration {
        Duration::from_millis(self.retry_wait_max_ms)
    }

    /// Returns `None` when timeouts are disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Attempts made before giving up, including the first.
    pub fn total_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::single_host()
    }
}
