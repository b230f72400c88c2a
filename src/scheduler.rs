// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication scheduler: one owning loop per database.
//!
//! The loop re-reads the destination list each cycle, launches at most
//! one worker per destination, and sleeps in the work context until the
//! local store signals a write or a timeout expires:
//!
//! ```text
//!            ┌────────────────────────────────────────────────┐
//!            ▼                                                │
//!   load destinations ──▶ throttle (data-driven only)         │
//!            │                     │                          │
//!            │            busy-flag CAS per destination       │
//!            │                     │                          │
//!            │              spawn workers ──▶ worker true?    │
//!            │                                  │ notify      │
//!            ▼                                  ▼             │
//!     wait_for_work(30s after data wake / 5m after idle) ─────┘
//! ```
//!
//! A worker that reports progress re-signals the work context, so the
//! next cycle is data-driven and the backlog keeps draining at the
//! short cadence (drain mode). Workers never propagate errors; the
//! spawning task logs panics and keeps the loop alive. The loop exits
//! only on shutdown.

use crate::config::ReplicationConfig;
use crate::destination::load_destinations;
use crate::failure::{should_skip_destination, FailureCount, FailureTracker};
use crate::heartbeat::spawn_sibling_notifier;
use crate::metrics;
use crate::store::DocumentStore;
use crate::transport::ReplicationTransport;
use crate::work::WorkContext;
use crate::worker::{replicate_to_destination, ActiveDestinations};
use crate::error::{ReplicationError, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,
    /// Scheduler loop running.
    Running,
    /// Shutdown requested, draining tasks.
    ShuttingDown,
    /// Shut down cleanly. Safe to drop.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Shared state the loop, workers, and the engine handle all see.
struct SchedulerShared<S, T> {
    config: ReplicationConfig,
    store: Arc<S>,
    transport: Arc<T>,
    work: Arc<WorkContext>,
    failures: Arc<FailureTracker>,
    active: Arc<ActiveDestinations>,
    /// Process-global cycle counter; bumped once per cycle that sees at
    /// least one destination. Drives the back-off modulus.
    attempt: AtomicU64,
    /// Warn about an empty destination list only once until it becomes
    /// non-empty again.
    warned_no_destinations: AtomicBool,
}

/// Run one scheduler pass. Returns the number of workers spawned.
async fn run_scheduler_cycle<S, T>(
    shared: &Arc<SchedulerShared<S, T>>,
    data_driven: bool,
) -> usize
where
    S: DocumentStore,
    T: ReplicationTransport,
{
    if !shared.work.should_continue() {
        return 0;
    }
    metrics::record_cycle(data_driven);

    let destinations = match load_destinations(shared.store.as_ref()).await {
        Ok(destinations) => destinations,
        Err(e) => {
            error!(error = %e, "failed to load replication destinations");
            return 0;
        }
    };

    if destinations.is_empty() {
        if !shared.warned_no_destinations.swap(true, Ordering::SeqCst) {
            warn!("no replication destinations configured");
        }
        return 0;
    }
    shared.warned_no_destinations.store(false, Ordering::SeqCst);

    let attempt = shared.attempt.fetch_add(1, Ordering::SeqCst) + 1;
    let mut spawned = 0;

    for destination in destinations {
        let url = destination.identity();

        if data_driven {
            let persisted = shared
                .failures
                .persisted_failure_count(shared.store.as_ref(), &url)
                .await;
            if should_skip_destination(persisted, attempt) {
                debug!(
                    url = %url,
                    persisted_failures = persisted,
                    attempt,
                    "destination throttled by failure back-off"
                );
                metrics::record_destination_skipped(&url);
                continue;
            }
        }

        let Some(guard) = shared.active.try_begin(&url) else {
            debug!(url = %url, "worker already in flight, skipping");
            continue;
        };

        metrics::record_worker_started(&url);
        spawned += 1;

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let _guard = guard;
            let url = destination.identity();
            let outcome = AssertUnwindSafe(replicate_to_destination(
                shared.store.as_ref(),
                shared.transport.as_ref(),
                &shared.failures,
                &shared.work,
                &shared.config.batch,
                &destination,
            ))
            .catch_unwind()
            .await;

            match outcome {
                Ok(true) => {
                    // Progress was made; more may be waiting.
                    debug!(url = %url, "worker reported progress, re-evaluating");
                    shared.work.notify_about_work();
                }
                Ok(false) => {}
                Err(_) => error!(url = %url, "replication worker panicked"),
            }
        });
    }

    spawned
}

/// The replication engine: owns the scheduler loop and its collaborators.
///
/// ```rust,no_run
/// use outbound_replication::config::ReplicationConfig;
/// use outbound_replication::http::HttpTransport;
/// use outbound_replication::scheduler::ReplicationEngine;
/// use outbound_replication::store::{DocumentStore, MemoryStore};
/// use std::sync::Arc;
///
/// # async fn example() -> outbound_replication::error::Result<()> {
/// let config = ReplicationConfig::default();
/// let store = Arc::new(MemoryStore::new("storage-1", "http://local:8080"));
/// let transport = Arc::new(HttpTransport::new(
///     &config.request,
///     store.server_url(),
///     store.storage_id(),
/// )?);
///
/// let mut engine = ReplicationEngine::new(config, store, transport);
/// engine.start()?;
/// // ... the store calls engine.work_context().notify_about_work() on writes ...
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ReplicationEngine<S, T> {
    shared: Arc<SchedulerShared<S, T>>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    handles: Vec<JoinHandle<()>>,
}

impl<S, T> ReplicationEngine<S, T>
where
    S: DocumentStore,
    T: ReplicationTransport,
{
    /// Create an engine in the `Created` state.
    pub fn new(config: ReplicationConfig, store: Arc<S>, transport: Arc<T>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                store,
                transport,
                work: Arc::new(WorkContext::new()),
                failures: Arc::new(FailureTracker::new()),
                active: Arc::new(ActiveDestinations::new()),
                attempt: AtomicU64::new(0),
                warned_no_destinations: AtomicBool::new(false),
            }),
            state_tx,
            state_rx,
            handles: Vec::new(),
        }
    }

    /// The work context. The host store calls
    /// [`WorkContext::notify_about_work`] on client writes.
    pub fn work_context(&self) -> &Arc<WorkContext> {
        &self.shared.work
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the scheduler loop is running.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Immutable snapshot of per-destination failure state, for
    /// operational tooling.
    pub fn failure_stats(&self) -> HashMap<String, FailureCount> {
        self.shared.failures.snapshot()
    }

    /// Start the scheduler loop and the sibling notifier.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            server_url = self.shared.store.server_url(),
            storage_id = self.shared.store.storage_id(),
            "starting replication engine"
        );

        if self.shared.config.sibling.enabled {
            let handles = spawn_sibling_notifier(
                Arc::clone(&self.shared.store),
                Arc::clone(&self.shared.transport),
                self.shared.config.sibling.clone(),
                self.shared.work.shutdown_receiver(),
            );
            self.handles.extend(handles);
        }

        let shared = Arc::clone(&self.shared);
        self.handles.push(tokio::spawn(run_loop(shared)));

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        Ok(())
    }

    /// Run a single scheduler pass outside the loop.
    ///
    /// Used by embedders that drive their own cadence, and by tests.
    /// Returns the number of workers spawned.
    pub async fn run_cycle(&self, data_driven: bool) -> usize {
        run_scheduler_cycle(&self.shared, data_driven).await
    }

    /// Shut down gracefully: stop the loop, let in-flight workers
    /// observe the signal, and join the engine's tasks.
    pub async fn shutdown(&mut self) {
        info!("shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        self.shared.work.begin_shutdown();

        let drain_timeout = std::time::Duration::from_secs(10);
        for (index, handle) in self.handles.drain(..).enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = index, "task completed"),
                Ok(Err(e)) => warn!(task = index, error = %e, "task panicked during shutdown"),
                Err(_) => warn!(task = index, "task timed out during shutdown"),
            }
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("replication engine stopped");
    }
}

/// The owning loop. Exits only when the work context flips to shutdown.
async fn run_loop<S, T>(shared: Arc<SchedulerShared<S, T>>)
where
    S: DocumentStore,
    T: ReplicationTransport,
{
    let mut work_rx = shared.work.subscribe();
    work_rx.mark_unchanged();

    let data_driven_wait = shared.config.scheduler.data_driven_wait_duration();
    let idle_wait = shared.config.scheduler.idle_wait_duration();

    info!(
        data_driven_wait_ms = data_driven_wait.as_millis() as u64,
        idle_wait_ms = idle_wait.as_millis() as u64,
        "replication scheduler loop started"
    );

    // The first cycle runs unprompted and counts as idle.
    let mut data_driven = false;

    while shared.work.should_continue() {
        run_scheduler_cycle(&shared, data_driven).await;

        let timeout = if data_driven { data_driven_wait } else { idle_wait };
        data_driven = shared
            .work
            .wait_for_work(timeout, &mut work_rx, "replication-scheduler")
            .await;
    }

    info!("replication scheduler loop stopped");
}
