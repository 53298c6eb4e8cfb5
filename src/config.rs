//! Configuration for the canteen engine.
//!
//! This module provides the tunables for the sync layer and the deadline
//! watcher, with sensible defaults matched to a small group ordering over
//! tens of minutes. Settings can be loaded from a `canteen.toml`:
//!
//! ```toml
//! [sync]
//! max_attempts = 4
//! base_backoff_ms = 1000
//! backoff_cap_ms = 10000
//! op_timeout_ms = 15000
//! failure_threshold = 2
//!
//! [deadline]
//! poll_interval_ms = 1000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default retry budget per sync operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default backoff base (doubles per attempt).
const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;

/// Default ceiling for a single backoff wait.
const DEFAULT_BACKOFF_CAP_MS: u64 = 10_000;

/// Default per-attempt timeout for a remote read or write.
const DEFAULT_OP_TIMEOUT_MS: u64 = 15_000;

/// Consecutive failures tolerated before the connection is reported down.
const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Default wall-clock poll interval for the deadline watcher.
const DEFAULT_DEADLINE_POLL_MS: u64 = 1_000;

/// Tunables for the retry/backoff/timeout envelope around store operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Maximum attempts per operation before reporting exhaustion.
    pub max_attempts: u32,
    /// Backoff base in milliseconds; the wait is `base * 2^attempt + jitter`.
    pub base_backoff_ms: u64,
    /// Upper bound on a single backoff wait, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Per-attempt timeout, in milliseconds.
    pub op_timeout_ms: u64,
    /// Failures tolerated before `ConnectionState.is_connected` flips.
    pub failure_threshold: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            op_timeout_ms: DEFAULT_OP_TIMEOUT_MS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl SyncSettings {
    /// Set the retry budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff base.
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff_ms = base.as_millis() as u64;
        self
    }

    /// Set the backoff ceiling.
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap_ms = cap.as_millis() as u64;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the failure threshold for user-visible connection status.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Per-attempt timeout as a `Duration`.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Backoff wait before retrying `attempt` (0-based), without jitter.
    ///
    /// Saturates at the configured cap rather than overflowing for large
    /// attempt numbers.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let wait = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        Duration::from_millis(wait)
    }
}

/// Tunables for the deadline watcher task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineSettings {
    /// Wall-clock poll interval, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for DeadlineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_DEADLINE_POLL_MS,
        }
    }
}

impl DeadlineSettings {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level engine configuration, loadable from `canteen.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanteenConfig {
    pub sync: SyncSettings,
    pub deadline: DeadlineSettings,
}

impl CanteenConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CanteenConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from a TOML file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
