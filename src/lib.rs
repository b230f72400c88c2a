//! # Outbound Replication
//!
//! The push-side replication engine of a document database node:
//! continuously propagates newly written documents and attachments to a
//! configured set of remote peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         outbound-replication                            │
//! │                                                                         │
//! │  ┌───────────┐   wake    ┌───────────────┐  per destination  ┌───────┐  │
//! │  │WorkContext│──────────►│   Scheduler   │──────────────────►│Worker │  │
//! │  │(store     │           │ (throttling,  │   busy-flag CAS   │       │  │
//! │  │ signals)  │◄──────────│  busy flags)  │                   │       │  │
//! │  └───────────┘  progress └───────────────┘                   └───┬───┘  │
//! │                                                                  │      │
//! │        ┌──────────────┐   ┌───────────────┐   ┌─────────────┐    │      │
//! │        │FailureTracker│◄──│ Batch Builder │◄──│DocumentStore│◄───┤      │
//! │        │(persisted    │   │ (merge docs + │   │   (trait)   │    │      │
//! │        │ back-off)    │   │  tombstones)  │   └─────────────┘    │      │
//! │        └──────────────┘   └───────────────┘                      │      │
//! │                                                                  ▼      │
//! │                       ┌──────────────────────────────────────────────┐  │
//! │                       │ ReplicationTransport (HTTP): lastEtag GET/PUT│  │
//! │                       │ replicateDocs / replicateAttachments / beat  │  │
//! │                       └──────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Points
//!
//! - **The peer owns the cursor.** The sender persists no replication
//!   position; it asks each destination for its last-seen etag every
//!   cycle, which makes the sender restart-safe and delivery
//!   at-least-once with monotonic cursor advance.
//! - **Filtered records still advance the cursor.** When a whole region
//!   of the stream is filtered out for a destination, the sender pushes
//!   the new cursor explicitly instead of re-scanning it forever.
//! - **Failure back-off is persisted.** Destinations accumulate failure
//!   counts in local storage; data-driven cycles skip unhealthy
//!   destinations by a skip-ratio, while idle cycles poll everyone.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbound_replication::{ReplicationConfig, ReplicationEngine};
//! use outbound_replication::http::HttpTransport;
//! use outbound_replication::store::{DocumentStore, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> outbound_replication::Result<()> {
//! let config = ReplicationConfig::default();
//! let store = Arc::new(MemoryStore::new("storage-1", "http://local:8080"));
//! let transport = Arc::new(HttpTransport::new(
//!     &config.request,
//!     store.server_url(),
//!     store.storage_id(),
//! )?);
//!
//! let mut engine = ReplicationEngine::new(config, store, transport);
//! engine.start()?;
//! // ... engine runs until shutdown ...
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod destination;
pub mod error;
pub mod etag;
pub mod failure;
pub mod heartbeat;
pub mod http;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod work;
pub mod worker;

// Re-exports for convenience
pub use config::ReplicationConfig;
pub use destination::{FilterRules, ReplicationDestination};
pub use error::{ReplicationError, Result};
pub use etag::Etag;
pub use failure::{FailureCount, FailureTracker};
pub use http::HttpTransport;
pub use scheduler::{EngineState, ReplicationEngine};
pub use store::{DocumentStore, MemoryStore};
pub use transport::{ReplicationTransport, SourceReplicationInformation};
pub use work::WorkContext;
