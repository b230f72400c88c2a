//! Peer transport trait.
//!
//! Defines the wire operations the engine needs against a peer: cursor
//! fetch/push, batch shipping, and the sibling heartbeat. The engine is
//! written against this trait; [`crate::http::HttpTransport`] is the
//! production implementation and the test suite substitutes a recording
//! double.
//!
//! The remote peer owns the cursor. The sender never persists one — it
//! re-fetches the peer's view every cycle, which is what makes the
//! sender restart-safe.

use crate::destination::ReplicationDestination;
use crate::error::Result;
use crate::etag::Etag;
use crate::store::{ReplicatedAttachment, ReplicatedDocument};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A peer's view of our replication progress, returned by its lastEtag
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReplicationInformation {
    /// Last document etag of ours the peer has applied.
    #[serde(default)]
    pub last_document_etag: Etag,
    /// Last attachment etag of ours the peer has applied.
    #[serde(default)]
    pub last_attachment_etag: Etag,
    /// The peer's unique instance id, passed to destination filters.
    #[serde(default)]
    pub server_instance_id: String,
}

/// Wire operations against one peer.
///
/// All methods are one-shot: retry policy lives in the worker and the
/// scheduler, never here.
pub trait ReplicationTransport: Send + Sync + 'static {
    /// `GET {destination}/replication/lastEtag` — fetch the peer's view
    /// of our cursor. `current_etag` is our most recent document etag,
    /// passed along for the peer's diagnostics.
    fn fetch_last_etag(
        &self,
        destination: &ReplicationDestination,
        current_etag: Etag,
    ) -> BoxFuture<'_, SourceReplicationInformation>;

    /// `PUT {destination}/replication/lastEtag` — advance the peer's
    /// stored cursor past records that were entirely filtered out.
    fn put_last_etag(
        &self,
        destination: &ReplicationDestination,
        document_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> BoxFuture<'_, ()>;

    /// `POST {destination}/replication/replicateDocs` — ship a document
    /// batch as a JSON array.
    fn ship_documents(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedDocument],
    ) -> BoxFuture<'_, ()>;

    /// `POST {destination}/replication/replicateAttachments` — ship an
    /// attachment batch as a BSON array with an `Attachment-Ids` header.
    fn ship_attachments(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedAttachment],
    ) -> BoxFuture<'_, ()>;

    /// `POST {peer}/replication/heartbeat` — best-effort sibling
    /// wake-up on startup.
    fn heartbeat(&self, peer_url: &str) -> BoxFuture<'_, ()>;
}

/// A transport that talks to nobody.
///
/// Answers every cursor fetch with zero etags and accepts every batch.
/// Useful for standalone runs and tests that only exercise scheduling.
#[derive(Debug, Clone, Default)]
pub struct NoOpTransport;

impl ReplicationTransport for NoOpTransport {
    fn fetch_last_etag(
        &self,
        destination: &ReplicationDestination,
        _current_etag: Etag,
    ) -> BoxFuture<'_, SourceReplicationInformation> {
        let url = destination.effective_url();
        Box::pin(async move {
            tracing::debug!(url = %url, "NoOp: answering lastEtag with zeros");
            Ok(SourceReplicationInformation {
                last_document_etag: Etag::ZERO,
                last_attachment_etag: Etag::ZERO,
                server_instance_id: "noop".to_string(),
            })
        })
    }

    fn put_last_etag(
        &self,
        destination: &ReplicationDestination,
        document_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> BoxFuture<'_, ()> {
        let url = destination.effective_url();
        Box::pin(async move {
            tracing::debug!(
                url = %url,
                document_etag = ?document_etag,
                attachment_etag = ?attachment_etag,
                "NoOp: would push cursor"
            );
            Ok(())
        })
    }

    fn ship_documents(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedDocument],
    ) -> BoxFuture<'_, ()> {
        let url = destination.effective_url();
        let count = records.len();
        Box::pin(async move {
            tracing::debug!(url = %url, count, "NoOp: would ship documents");
            Ok(())
        })
    }

    fn ship_attachments(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedAttachment],
    ) -> BoxFuture<'_, ()> {
        let url = destination.effective_url();
        let count = records.len();
        Box::pin(async move {
            tracing::debug!(url = %url, count, "NoOp: would ship attachments");
            Ok(())
        })
    }

    fn heartbeat(&self, peer_url: &str) -> BoxFuture<'_, ()> {
        let peer_url = peer_url.to_string();
        Box::pin(async move {
            tracing::debug!(url = %peer_url, "NoOp: would send heartbeat");
            Ok(())
        })
    }
}
