//! Configuration for the replication engine.
//!
//! Configuration covers tunables only: wait intervals, batch caps,
//! request timeouts, and the sibling notifier. The destination list is
//! **not** part of this struct — destinations live in the
//! `replication/destinations` document in local storage and are re-read
//! on every scheduler cycle, so they can be changed at runtime without
//! restarting the engine.
//!
//! Durations are humantime strings (`"30s"`, `"5m"`) so the config can
//! be deserialized from YAML/JSON verbatim.
//!
//! # Quick Start
//!
//! ```rust
//! use outbound_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig::default();
//! assert_eq!(config.batch.max_records, 100);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Scheduler wake/sleep tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Batch selection caps.
    #[serde(default)]
    pub batch: BatchLimits,

    /// Outbound HTTP request tuning.
    #[serde(default)]
    pub request: RequestConfig,

    /// Startup sibling notification.
    #[serde(default)]
    pub sibling: SiblingConfig,
}

impl ReplicationConfig {
    /// Fast waits and tiny pages for tests.
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                data_driven_wait: "50ms".to_string(),
                idle_wait: "200ms".to_string(),
            },
            batch: BatchLimits::default(),
            request: RequestConfig {
                timeout: "2s".to_string(),
            },
            sibling: SiblingConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SchedulerConfig: wake/sleep policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduler wake/sleep policy.
///
/// After a data-driven wake (a local write was observed) the loop waits
/// a short interval before re-checking; after an idle timeout it waits
/// the long interval. The long wake replicates every destination
/// regardless of failure counts, so a dead node is still polled slowly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wait after a data-driven cycle.
    #[serde(default = "default_data_driven_wait")]
    pub data_driven_wait: String,

    /// Wait after an idle (timer-driven) cycle.
    #[serde(default = "default_idle_wait")]
    pub idle_wait: String,
}

fn default_data_driven_wait() -> String {
    "30s".to_string()
}

fn default_idle_wait() -> String {
    "5m".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_driven_wait: default_data_driven_wait(),
            idle_wait: default_idle_wait(),
        }
    }
}

impl SchedulerConfig {
    /// Parse the data-driven wait, falling back to 30 s on bad input.
    pub fn data_driven_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.data_driven_wait).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the idle wait, falling back to 5 min on bad input.
    pub fn idle_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_wait).unwrap_or(Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchLimits: batch selection caps
// ═══════════════════════════════════════════════════════════════════════════════

/// Caps on a single outbound batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum records (documents or attachments) per batch probe.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Maximum total payload bytes per batch probe.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_records() -> usize {
    100
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RequestConfig: outbound HTTP
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound HTTP request tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub timeout: String,
}

fn default_request_timeout() -> String {
    "60s".to_string()
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: default_request_timeout(),
        }
    }
}

impl RequestConfig {
    /// Parse the timeout, falling back to 60 s on bad input.
    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SiblingConfig: startup heartbeat to previously-seen sources
// ═══════════════════════════════════════════════════════════════════════════════

/// Startup sibling notification settings.
///
/// On startup the engine pages through stored source-peer records and
/// sends each one a best-effort heartbeat so they resume pushing to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingConfig {
    /// Whether to notify siblings on startup.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Source records fetched per storage page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Bound on the notification queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the drain worker blocks on an empty queue before
    /// re-checking for shutdown.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    128
}

fn default_queue_capacity() -> usize {
    512
}

fn default_poll_timeout() -> String {
    "15s".to_string()
}

impl Default for SiblingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: default_page_size(),
            queue_capacity: default_queue_capacity(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

impl SiblingConfig {
    /// Parse the poll timeout, falling back to 15 s on bad input.
    pub fn poll_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_timeout).unwrap_or(Duration::from_secs(15))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
