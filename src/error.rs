// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they occur and whether the next
//! scheduler cycle should simply try again.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Counted against destination | Description |
//! |------------|-----------|-----------------------------|-------------|
//! | `Http` | Yes | Yes | Timeouts, connection resets, 5xx from a peer |
//! | `ReplicationNotEnabled` | Yes | Yes | 400/404 from the peer's lastEtag endpoint |
//! | `BatchRejected` | Yes | Yes | Peer refused a replicateDocs/replicateAttachments batch |
//! | `Storage` | No | No | Local store failed while building a batch |
//! | `Config` | No | No | Malformed destination entry |
//! | `InvalidState` | No | No | Engine lifecycle violation |
//! | `Shutdown` | No | No | Engine is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! "Counted" errors feed the per-destination failure tracker and its
//! persisted back-off; the others are logged and the batch is dropped
//! without penalizing the destination.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating to peers.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transient network failure talking to a peer.
    ///
    /// Covers timeouts, connection resets, and 5xx responses.
    /// Retryable; counted against the destination.
    #[error("HTTP error talking to {url}: {message}")]
    Http { url: String, message: String },

    /// The peer answered the lastEtag request with 400/404.
    ///
    /// This means replication is not enabled (or not configured for us)
    /// on the peer. Logged distinctly from connection failures so an
    /// operator can tell a misconfigured peer from a dead one.
    #[error("replication not enabled on peer {url}")]
    ReplicationNotEnabled { url: String },

    /// The peer rejected a shipped batch with a non-2xx status.
    ///
    /// If the response body was a JSON object with an `Error` field,
    /// `message` carries that text; otherwise the raw body.
    #[error("peer {url} rejected batch: {message}")]
    BatchRejected { url: String, message: String },

    /// Local storage failed while building a batch.
    ///
    /// Not counted against the destination: the peer did nothing wrong.
    /// The next cycle retries from the same remote cursor.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. `start()` on a running engine).
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transient HTTP error.
    pub fn http(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Check if the next cycle should simply try this operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } => true,
            Self::ReplicationNotEnabled { .. } => true,
            Self::BatchRejected { .. } => true,
            Self::Storage(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this failure counts against the destination's
    /// persisted failure count.
    pub fn counts_against_destination(&self) -> bool {
        matches!(
            self,
            Self::Http { .. } | Self::ReplicationNotEnabled { .. } | Self::BatchRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_retryable_and_counted() {
        let err = ReplicationError::http("http://peer:8080", "connection reset");
        assert!(err.is_retryable());
        assert!(err.counts_against_destination());
        assert!(err.to_string().contains("http://peer:8080"));
    }

    #[test]
    fn test_not_enabled_counted_but_distinct() {
        let err = ReplicationError::ReplicationNotEnabled {
            url: "http://peer:8080/databases/db".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.counts_against_destination());
        assert!(err.to_string().contains("not enabled"));
    }

    #[test]
    fn test_batch_rejected_carries_peer_message() {
        let err = ReplicationError::BatchRejected {
            url: "http://peer:8080".to_string(),
            message: "conflict on users/1".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("conflict on users/1"));
    }

    #[test]
    fn test_storage_not_counted() {
        let err = ReplicationError::Storage("read failed".to_string());
        assert!(!err.is_retryable());
        assert!(!err.counts_against_destination());
    }

    #[test]
    fn test_config_not_retryable() {
        let err = ReplicationError::Config("bad destination url".to_string());
        assert!(!err.is_retryable());
        assert!(!err.counts_against_destination());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_shutdown_not_retryable() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }

    #[test]
    fn test_internal_not_retryable() {
        let err = ReplicationError::Internal("unexpected".to_string());
        assert!(!err.is_retryable());
    }
}
