//! Per-destination failure accounting and back-off.
//!
//! Two layers of state:
//!
//! - **In-memory** ([`FailureTracker`]): url → `{count, timestamp,
//!   last_error}`. Drives the first-failure retry and is exposed to
//!   operational tooling via [`FailureTracker::snapshot`]. Invariant:
//!   `count == 0` iff the last observed attempt succeeded or none was
//!   made.
//! - **Persisted** (one document per destination at
//!   `replication/destinations-failure/{escaped-url}`): survives
//!   restarts so back-off is preserved. Present ⇒ the destination has
//!   at least one unreset failure. Deleted on success.
//!
//! The scheduler throttles by the **persisted** count: the higher the
//! count, the more data-driven cycles skip the destination
//! ([`should_skip_destination`]). Time-driven cycles replicate every
//! destination regardless, so a dead node keeps getting polled slowly
//! while a flurry of writes does not hammer it.

use crate::destination::escape_destination_url;
use crate::metrics;
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Key prefix of the persisted failure documents.
pub const FAILURE_KEY_PREFIX: &str = "replication/destinations-failure/";

/// Build the storage key of a destination's failure document.
pub fn failure_document_key(url: &str) -> String {
    format!("{}{}", FAILURE_KEY_PREFIX, escape_destination_url(url))
}

/// In-memory failure record for one destination.
#[derive(Debug, Clone)]
pub struct FailureCount {
    /// Consecutive failed attempts since the last success.
    pub count: u64,
    /// UTC timestamp of the last mutation.
    pub timestamp: DateTime<Utc>,
    /// Most recent error text.
    pub last_error: String,
}

/// Shape of the persisted failure document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationFailureInformation {
    /// The destination's effective URL.
    pub destination: String,
    /// Accumulated failure count.
    pub failure_count: u64,
}

/// Tracks failures per destination URL, in memory and on disk.
#[derive(Default)]
pub struct FailureTracker {
    counts: DashMap<String, FailureCount>,
}

impl FailureTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the destination's prior state was healthy: no record
    /// yet, or a record with `count == 0`. Gates the one-shot immediate
    /// retry in the worker.
    pub fn is_first_failure(&self, url: &str) -> bool {
        self.counts.get(url).map(|c| c.count == 0).unwrap_or(true)
    }

    /// In-memory count for a destination (0 if never failed).
    pub fn count(&self, url: &str) -> u64 {
        self.counts.get(url).map(|c| c.count).unwrap_or(0)
    }

    /// Record a failed attempt: bump the in-memory count, stamp time and
    /// error text, then bump the persisted document.
    pub async fn increment<S: DocumentStore + ?Sized>(&self, store: &S, url: &str, error: &str) {
        let count = {
            let mut entry = self.counts.entry(url.to_string()).or_insert(FailureCount {
                count: 0,
                timestamp: Utc::now(),
                last_error: String::new(),
            });
            entry.count += 1;
            entry.timestamp = Utc::now();
            entry.last_error = error.to_string();
            entry.count
        };

        debug!(url, count, error, "recorded replication failure");
        metrics::set_failure_count(url, count);

        let key = failure_document_key(url);
        let persisted = self.persisted_failure_count(store, url).await;
        let info = DestinationFailureInformation {
            destination: url.to_string(),
            failure_count: persisted + 1,
        };
        match serde_json::to_value(&info) {
            Ok(doc) => {
                if let Err(e) = store.put(&key, doc).await {
                    warn!(url, error = %e, "failed to persist failure information");
                }
            }
            Err(e) => warn!(url, error = %e, "failed to serialize failure information"),
        }
    }

    /// Record a successful attempt: zero the in-memory count, stamp
    /// time, and delete the persisted document.
    pub async fn reset<S: DocumentStore + ?Sized>(&self, store: &S, url: &str) {
        {
            let mut entry = self.counts.entry(url.to_string()).or_insert(FailureCount {
                count: 0,
                timestamp: Utc::now(),
                last_error: String::new(),
            });
            entry.count = 0;
            entry.timestamp = Utc::now();
            entry.last_error.clear();
        }
        metrics::set_failure_count(url, 0);

        let key = failure_document_key(url);
        if let Err(e) = store.delete(&key).await {
            warn!(url, error = %e, "failed to delete failure information");
        }
    }

    /// Read the persisted failure count (0 if absent or unreadable).
    pub async fn persisted_failure_count<S: DocumentStore + ?Sized>(
        &self,
        store: &S,
        url: &str,
    ) -> u64 {
        let key = failure_document_key(url);
        match store.get(&key).await {
            Ok(Some(doc)) => {
                match serde_json::from_value::<DestinationFailureInformation>(doc.data) {
                    Ok(info) => info.failure_count,
                    Err(e) => {
                        warn!(url, error = %e, "failure information document is malformed");
                        0
                    }
                }
            }
            Ok(None) => 0,
            Err(e) => {
                warn!(url, error = %e, "failed to read failure information");
                0
            }
        }
    }

    /// Immutable snapshot of the in-memory failure map, for
    /// observability endpoints.
    pub fn snapshot(&self) -> HashMap<String, FailureCount> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Back-off policy: decide whether a data-driven cycle skips a
/// destination, based on its persisted failure count `f` and the
/// process-global cycle counter `attempt`.
///
/// | f | replicate when |
/// |---|----------------|
/// | ≤ 10 | always |
/// | 11..=100 | `attempt % 2 == 0` |
/// | 101..=1000 | `attempt % 5 == 0` |
/// | > 1000 | `attempt % 10 == 0` |
///
/// Time-driven cycles never consult this policy.
pub fn should_skip_destination(persisted_failures: u64, attempt: u64) -> bool {
    let modulus = match persisted_failures {
        0..=10 => return false,
        11..=100 => 2,
        101..=1000 => 5,
        _ => 10,
    };
    attempt % modulus != 0
}
