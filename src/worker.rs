// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-destination replication worker.
//!
//! One invocation per destination per scheduler cycle, never
//! overlapping itself: the scheduler acquires the destination's busy
//! flag before spawning a worker and the [`BusyGuard`] clears it when
//! the worker's future is dropped — normal return, panic, or
//! cancellation alike.
//!
//! # One Invocation
//!
//! 1. Fetch the peer's view of our cursor (skip the cycle on any error).
//! 2. Documents phase: build a batch from the remote document etag;
//!    ship it, or push the cursor if everything was filtered out.
//! 3. Attachments phase: same against the remote attachment etag.
//! 4. Return `true` iff something shipped — the scheduler treats that
//!    as "more may be waiting" and re-evaluates immediately.
//!
//! A destination transitioning from healthy to failing gets one
//! immediate retry; after that the failure is counted and the cycle
//! ends for this destination.

use crate::batch::{build_attachment_batch, build_document_batch};
use crate::config::BatchLimits;
use crate::destination::ReplicationDestination;
use crate::error::ReplicationError;
use crate::etag::Etag;
use crate::failure::FailureTracker;
use crate::metrics;
use crate::store::DocumentStore;
use crate::transport::ReplicationTransport;
use crate::work::WorkContext;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Per-destination busy flags.
///
/// The scheduler performs a set-if-zero before launching a worker;
/// a failed exchange means a worker is already in flight and the
/// destination is skipped this cycle.
#[derive(Default)]
pub struct ActiveDestinations {
    flags: DashMap<String, Arc<AtomicU32>>,
}

impl ActiveDestinations {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to mark a destination busy. `None` means a worker already
    /// holds the flag.
    pub fn try_begin(&self, url: &str) -> Option<BusyGuard> {
        let flag = self
            .flags
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        match flag.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Some(BusyGuard { flag }),
            Err(_) => None,
        }
    }

    /// Whether a worker currently holds the destination's flag.
    pub fn is_busy(&self, url: &str) -> bool {
        self.flags
            .get(url)
            .map(|f| f.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }
}

/// Clears the destination's busy flag when dropped.
///
/// The spawned worker task owns the guard, so the flag is released on
/// every exit path including panics and cancellation.
pub struct BusyGuard {
    flag: Arc<AtomicU32>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(0, Ordering::Release);
    }
}

/// Run one replication pass against one destination.
///
/// Returns `true` iff at least one batch shipped. Never returns an
/// error: every failure is logged and accounted here.
pub async fn replicate_to_destination<S, T>(
    store: &S,
    transport: &T,
    failures: &FailureTracker,
    work: &WorkContext,
    limits: &BatchLimits,
    destination: &ReplicationDestination,
) -> bool
where
    S: DocumentStore + ?Sized,
    T: ReplicationTransport + ?Sized,
{
    // Keyed case-insensitively: case variants of one URL share failure
    // state and mutual exclusion.
    let url = destination.identity();
    let span = tracing::info_span!("replicate", url = %url);

    async move {
        if work.is_shutting_down() {
            return false;
        }

        let current_etag = match store.most_recent_document_etag().await {
            Ok(etag) => etag,
            Err(e) => {
                warn!(error = %e, "failed to read most recent document etag");
                Etag::ZERO
            }
        };

        let remote = match transport.fetch_last_etag(destination, current_etag).await {
            Ok(info) => {
                metrics::record_cursor_fetch(&url, true);
                info
            }
            Err(ReplicationError::ReplicationNotEnabled { url: peer }) => {
                info!(peer = %peer, "replication not enabled on peer, skipping this cycle");
                metrics::record_cursor_fetch(&url, false);
                return false;
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch remote cursor, skipping this cycle");
                metrics::record_cursor_fetch(&url, false);
                return false;
            }
        };

        let mut replicated: Option<bool> = None;

        // Documents phase.
        if work.is_shutting_down() {
            return false;
        }
        match build_document_batch(
            store,
            remote.last_document_etag,
            &destination.filter,
            &remote.server_instance_id,
            limits,
        )
        .await
        {
            Err(e) => {
                // Local storage trouble: no remote call, and the
                // destination is not penalized for it.
                warn!(error = %e, "failed to build document batch");
                return replicated.unwrap_or(false);
            }
            Ok(batch) if batch.records.is_empty() => {
                if batch.attempted_etag > remote.last_document_etag {
                    debug!(
                        attempted_etag = %batch.attempted_etag,
                        "nothing passed the filter, pushing document cursor"
                    );
                    if let Err(e) = transport
                        .put_last_etag(destination, Some(batch.attempted_etag), None)
                        .await
                    {
                        warn!(error = %e, "failed to push document cursor");
                    }
                }
            }
            Ok(batch) => {
                let count = batch.records.len();
                match ship_documents_with_retry(transport, failures, destination, &url, &batch)
                    .await
                {
                    Ok(()) => {
                        failures.reset(store, &url).await;
                        metrics::record_ship(&url, "documents", count, true);
                        debug!(count, end_etag = %batch.attempted_etag, "document batch shipped");
                        replicated = Some(true);
                    }
                    Err(e) => {
                        metrics::record_ship(&url, "documents", count, false);
                        failures.increment(store, &url, &e.to_string()).await;
                        return false;
                    }
                }
            }
        }

        // Attachments phase.
        if work.is_shutting_down() {
            return replicated.unwrap_or(false);
        }
        match build_attachment_batch(
            store,
            remote.last_attachment_etag,
            &destination.filter,
            &remote.server_instance_id,
            limits,
        )
        .await
        {
            Err(e) => {
                warn!(error = %e, "failed to build attachment batch");
                return replicated.unwrap_or(false);
            }
            Ok(batch) if batch.records.is_empty() => {
                if batch.attempted_etag > remote.last_attachment_etag {
                    debug!(
                        attempted_etag = %batch.attempted_etag,
                        "nothing passed the filter, pushing attachment cursor"
                    );
                    if let Err(e) = transport
                        .put_last_etag(destination, None, Some(batch.attempted_etag))
                        .await
                    {
                        warn!(error = %e, "failed to push attachment cursor");
                    }
                }
            }
            Ok(batch) => {
                let count = batch.records.len();
                match ship_attachments_with_retry(transport, failures, destination, &url, &batch)
                    .await
                {
                    Ok(()) => {
                        failures.reset(store, &url).await;
                        metrics::record_ship(&url, "attachments", count, true);
                        debug!(count, end_etag = %batch.attempted_etag, "attachment batch shipped");
                        replicated = Some(true);
                    }
                    Err(e) => {
                        metrics::record_ship(&url, "attachments", count, false);
                        failures.increment(store, &url, &e.to_string()).await;
                        return false;
                    }
                }
            }
        }

        replicated.unwrap_or(false)
    }
    .instrument(span)
    .await
}

async fn ship_documents_with_retry<T>(
    transport: &T,
    failures: &FailureTracker,
    destination: &ReplicationDestination,
    url: &str,
    batch: &crate::batch::DocumentBatch,
) -> crate::error::Result<()>
where
    T: ReplicationTransport + ?Sized,
{
    match transport.ship_documents(destination, &batch.records).await {
        Ok(()) => Ok(()),
        Err(first) if failures.is_first_failure(url) => {
            info!(error = %first, "first failure for destination, retrying once");
            transport.ship_documents(destination, &batch.records).await
        }
        Err(first) => Err(first),
    }
}

async fn ship_attachments_with_retry<T>(
    transport: &T,
    failures: &FailureTracker,
    destination: &ReplicationDestination,
    url: &str,
    batch: &crate::batch::AttachmentBatch,
) -> crate::error::Result<()>
where
    T: ReplicationTransport + ?Sized,
{
    match transport.ship_attachments(destination, &batch.records).await {
        Ok(()) => Ok(()),
        Err(first) if failures.is_first_failure(url) => {
            info!(error = %first, "first failure for destination, retrying once");
            transport.ship_attachments(destination, &batch.records).await
        }
        Err(first) => Err(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ReplicatedAttachment, ReplicatedDocument};
    use crate::transport::{BoxFuture, SourceReplicationInformation};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Transport double that counts calls and can fail the first N
    /// ship attempts.
    struct TrackingTransport {
        fetch_count: AtomicUsize,
        doc_ship_count: AtomicUsize,
        attachment_ship_count: AtomicUsize,
        fail_doc_ships: AtomicUsize,
        fail_fetch: std::sync::atomic::AtomicBool,
        cursor_pushes: Mutex<Vec<(Option<Etag>, Option<Etag>)>>,
        remote: Mutex<SourceReplicationInformation>,
    }

    impl TrackingTransport {
        fn new() -> Self {
            Self {
                fetch_count: AtomicUsize::new(0),
                doc_ship_count: AtomicUsize::new(0),
                attachment_ship_count: AtomicUsize::new(0),
                fail_doc_ships: AtomicUsize::new(0),
                fail_fetch: std::sync::atomic::AtomicBool::new(false),
                cursor_pushes: Mutex::new(Vec::new()),
                remote: Mutex::new(SourceReplicationInformation {
                    last_document_etag: Etag::ZERO,
                    last_attachment_etag: Etag::ZERO,
                    server_instance_id: "peer-instance".to_string(),
                }),
            }
        }

        fn fail_next_doc_ships(&self, n: usize) {
            self.fail_doc_ships.store(n, Ordering::SeqCst);
        }

        fn pushes(&self) -> Vec<(Option<Etag>, Option<Etag>)> {
            self.cursor_pushes.lock().unwrap().clone()
        }
    }

    impl ReplicationTransport for TrackingTransport {
        fn fetch_last_etag(
            &self,
            destination: &ReplicationDestination,
            _current_etag: Etag,
        ) -> BoxFuture<'_, SourceReplicationInformation> {
            let url = destination.effective_url();
            Box::pin(async move {
                self.fetch_count.fetch_add(1, Ordering::SeqCst);
                if self.fail_fetch.load(Ordering::SeqCst) {
                    return Err(ReplicationError::http(url, "connection refused"));
                }
                Ok(self.remote.lock().unwrap().clone())
            })
        }

        fn put_last_etag(
            &self,
            _destination: &ReplicationDestination,
            document_etag: Option<Etag>,
            attachment_etag: Option<Etag>,
        ) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.cursor_pushes
                    .lock()
                    .unwrap()
                    .push((document_etag, attachment_etag));
                Ok(())
            })
        }

        fn ship_documents(
            &self,
            destination: &ReplicationDestination,
            _records: &[ReplicatedDocument],
        ) -> BoxFuture<'_, ()> {
            let url = destination.effective_url();
            Box::pin(async move {
                self.doc_ship_count.fetch_add(1, Ordering::SeqCst);
                let remaining = self.fail_doc_ships.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_doc_ships.store(remaining - 1, Ordering::SeqCst);
                    return Err(ReplicationError::BatchRejected {
                        url,
                        message: "status 503".to_string(),
                    });
                }
                Ok(())
            })
        }

        fn ship_attachments(
            &self,
            _destination: &ReplicationDestination,
            _records: &[ReplicatedAttachment],
        ) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.attachment_ship_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn heartbeat(&self, _peer_url: &str) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn fixture() -> (MemoryStore, TrackingTransport, FailureTracker, WorkContext) {
        (
            MemoryStore::new("s1", "http://local:8080"),
            TrackingTransport::new(),
            FailureTracker::new(),
            WorkContext::new(),
        )
    }

    fn dest() -> ReplicationDestination {
        ReplicationDestination::for_testing("http://peer:8080")
    }

    async fn run(
        store: &MemoryStore,
        transport: &TrackingTransport,
        failures: &FailureTracker,
        work: &WorkContext,
    ) -> bool {
        replicate_to_destination(
            store,
            transport,
            failures,
            work,
            &BatchLimits::default(),
            &dest(),
        )
        .await
    }

    #[tokio::test]
    async fn test_happy_path_ships_documents() {
        let (store, transport, failures, work) = fixture();
        for i in 1..=3 {
            store
                .write_document(&format!("users/{}", i), json!({"n": i}))
                .await;
        }

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(replicated);
        assert_eq!(transport.fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 1);
        assert!(transport.pushes().is_empty());
        assert!(failures.is_first_failure("http://peer:8080"));
    }

    #[tokio::test]
    async fn test_empty_store_ships_nothing() {
        let (store, transport, failures, work) = fixture();

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 0);
        assert_eq!(transport.attachment_ship_count.load(Ordering::SeqCst), 0);
        assert!(transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_all_filtered_pushes_cursor_instead_of_shipping() {
        let (store, transport, failures, work) = fixture();
        let mut last = Etag::ZERO;
        for i in 0..5 {
            last = store
                .write_document(&format!("replication/x/{}", i), json!({"n": i}))
                .await;
        }

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 0);
        assert_eq!(transport.pushes(), vec![(Some(last), None)]);
    }

    #[tokio::test]
    async fn test_first_failure_retries_once_and_recovers() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        transport.fail_next_doc_ships(1);

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 2);
        assert_eq!(failures.count("http://peer:8080"), 0);
        assert_eq!(
            failures
                .persisted_failure_count(&store, "http://peer:8080")
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_first_failure_retry_still_failing_counts_once() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        transport.fail_next_doc_ships(2);

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 2);
        assert_eq!(failures.count("http://peer:8080"), 1);
        assert_eq!(
            failures
                .persisted_failure_count(&store, "http://peer:8080")
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_known_unhealthy_destination_gets_no_retry() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        failures.increment(&store, "http://peer:8080", "earlier").await;
        transport.fail_next_doc_ships(1);

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        // No immediate retry: one attempt only.
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 1);
        assert_eq!(failures.count("http://peer:8080"), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_state() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        failures.increment(&store, "http://peer:8080", "earlier").await;
        failures.increment(&store, "http://peer:8080", "earlier").await;

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(replicated);
        assert_eq!(failures.count("http://peer:8080"), 0);
        assert_eq!(
            failures
                .persisted_failure_count(&store, "http://peer:8080")
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_cycle_without_counting() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        transport.fail_fetch.store(true, Ordering::SeqCst);

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 0);
        assert_eq!(failures.count("http://peer:8080"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_returns_immediately() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        work.begin_shutdown();

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        assert_eq!(transport.fetch_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attachments_ship_after_documents() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        store.write_attachment("files/1", vec![1, 2, 3]).await;

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 1);
        assert_eq!(transport.attachment_ship_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attachments_only_still_reports_progress() {
        let (store, transport, failures, work) = fixture();
        store.write_attachment("files/1", vec![9]).await;

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 0);
        assert_eq!(transport.attachment_ship_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_cursor_is_respected() {
        let (store, transport, failures, work) = fixture();
        store.write_document("users/1", json!({"n": 1})).await;
        let e2 = store.write_document("users/2", json!({"n": 2})).await;
        // Peer already has everything.
        transport.remote.lock().unwrap().last_document_etag = e2;

        let replicated = run(&store, &transport, &failures, &work).await;

        assert!(!replicated);
        assert_eq!(transport.doc_ship_count.load(Ordering::SeqCst), 0);
        assert!(transport.pushes().is_empty());
    }

    #[test]
    fn test_busy_flag_mutual_exclusion() {
        let active = ActiveDestinations::new();

        let guard = active.try_begin("http://peer:8080");
        assert!(guard.is_some());
        assert!(active.is_busy("http://peer:8080"));

        // Second acquisition fails while the first is held.
        assert!(active.try_begin("http://peer:8080").is_none());

        // Other destinations are independent.
        assert!(active.try_begin("http://other:8080").is_some());

        drop(guard);
        assert!(!active.is_busy("http://peer:8080"));
        assert!(active.try_begin("http://peer:8080").is_some());
    }

    #[test]
    fn test_busy_flag_cleared_even_on_panic() {
        let active = std::sync::Arc::new(ActiveDestinations::new());
        let for_panic = std::sync::Arc::clone(&active);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = for_panic.try_begin("http://peer:8080").unwrap();
            panic!("worker blew up");
        }));

        assert!(result.is_err());
        assert!(!active.is_busy("http://peer:8080"));
    }
}
