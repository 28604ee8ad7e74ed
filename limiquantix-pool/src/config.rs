//! Tunables for connections, task polling and reconciliation.
//!
//! All structs deserialize with `#[serde(default)]` so a partial YAML section
//! only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection retry and login settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Attempts per call before the connection is evicted
    pub retry_count: u32,
    /// Sleep between transient-failure retries (milliseconds)
    pub retry_interval_ms: u64,
    /// API version sent with login
    pub api_version: String,
    /// Per-request HTTP timeout for the JSON-RPC transport (seconds)
    pub request_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_interval_ms: 1000,
            api_version: "1.0".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl ConnectionSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Polling settings for one async task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPolicy {
    /// Interval between `task.get_status` polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Wall-clock deadline for the whole task (milliseconds)
    pub timeout_ms: u64,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_ms: 600_000,
        }
    }
}

impl TaskPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval_ms: millis(poll_interval),
            timeout_ms: millis(timeout),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Point queries made before trusting a halted report
    pub stop_recheck_attempts: u32,
    /// Sleep between point queries (milliseconds)
    pub stop_recheck_interval_ms: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            stop_recheck_attempts: 3,
            stop_recheck_interval_ms: 500,
        }
    }
}

impl ReconcileSettings {
    pub fn stop_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.stop_recheck_interval_ms)
    }
}
