//! Startup sibling notification.
//!
//! Nodes that previously pushed to us leave a record under
//! `replication/sources/`. On startup we page through those records and
//! send each source a best-effort heartbeat so it knows we are back and
//! resumes pushing. Everything here is advisory: failures are warnings,
//! never errors.
//!
//! Two tasks cooperate through a bounded queue: a producer pages the
//! store (128 records at a time by default) and a drain worker posts
//! the heartbeats. A `None` sentinel marks the end of the enumeration;
//! the drain worker polls with a timeout so it also notices shutdown.

use crate::config::SiblingConfig;
use crate::metrics;
use crate::store::DocumentStore;
use crate::transport::ReplicationTransport;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Key prefix of stored source-peer records.
pub const SOURCES_PREFIX: &str = "replication/sources/";

/// Shape of a stored source-peer record. Only the source URL matters
/// here; unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct SourceRecord {
    #[serde(default)]
    source: Option<String>,
}

/// Spawn the sibling notifier tasks.
///
/// Returns the task handles so the engine can join them on shutdown.
pub fn spawn_sibling_notifier<S, T>(
    store: Arc<S>,
    transport: Arc<T>,
    config: SiblingConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: DocumentStore,
    T: ReplicationTransport,
{
    let (tx, rx) = mpsc::channel::<Option<String>>(config.queue_capacity.max(1));
    let page_size = config.page_size.max(1);
    let poll_timeout = config.poll_timeout_duration();

    let producer = tokio::spawn(enumerate_sources(store, page_size, tx));
    let drain = tokio::spawn(drain_queue(transport, rx, poll_timeout, shutdown));
    vec![producer, drain]
}

/// Page through stored source records and queue their URLs, terminated
/// by a `None` sentinel.
async fn enumerate_sources<S: DocumentStore>(
    store: Arc<S>,
    page_size: usize,
    tx: mpsc::Sender<Option<String>>,
) {
    let mut start = 0;
    let mut queued = 0usize;

    loop {
        let page = match store
            .documents_starting_with(SOURCES_PREFIX, start, page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "failed to enumerate source peers");
                break;
            }
        };
        let fetched = page.len();

        for doc in page {
            match serde_json::from_value::<SourceRecord>(doc.data) {
                Ok(SourceRecord { source: Some(url) }) if !url.is_empty() => {
                    if tx.send(Some(url)).await.is_err() {
                        return; // drain worker is gone
                    }
                    queued += 1;
                }
                _ => debug!(key = %doc.key, "source record carries no source url"),
            }
        }

        if fetched < page_size {
            break;
        }
        start += fetched;
    }

    debug!(queued, "source enumeration complete");
    let _ = tx.send(None).await;
}

/// Drain the queue, posting one heartbeat per source.
async fn drain_queue<T: ReplicationTransport>(
    transport: Arc<T>,
    mut rx: mpsc::Receiver<Option<String>>,
    poll_timeout: std::time::Duration,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            debug!("sibling notifier stopping on shutdown");
            break;
        }

        match tokio::time::timeout(poll_timeout, rx.recv()).await {
            Ok(Some(Some(url))) => match transport.heartbeat(&url).await {
                Ok(()) => {
                    debug!(url = %url, "notified sibling");
                    metrics::record_heartbeat(&url, true);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "sibling heartbeat failed");
                    metrics::record_heartbeat(&url, false);
                }
            },
            Ok(Some(None)) => {
                debug!("sibling notification complete");
                break;
            }
            Ok(None) => break, // producer dropped without sentinel
            Err(_) => {}       // poll timeout: loop to re-check shutdown
        }
    }
}
