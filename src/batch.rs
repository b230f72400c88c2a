//! Batch selection: the next slice of the stream for one destination.
//!
//! Given the destination's remote cursor, assemble the next batch of
//! documents (or attachments) by merging live records and tombstones in
//! etag order, bounded by record count and byte budget, then apply the
//! destination filter.
//!
//! # The Re-Batch Loop
//!
//! If a probe returns records but the filter drops *all* of them, the
//! builder advances its local cursor to the last examined etag and
//! probes again. Without this the sender would re-scan the same
//! filtered region forever. The final `attempted_etag` is what the
//! worker pushes to the peer when nothing ships, so the peer's cursor
//! moves past the region.
//!
//! ```text
//! start ──▶ probe ──▶ merge docs+tombstones ──▶ filter
//!             ▲                                   │
//!             │          all dropped              │ kept non-empty
//!             └────── cursor = last etag ◀────────┤
//!                                                 ▼
//!                              (kept records, last examined etag)
//! ```

use crate::config::BatchLimits;
use crate::destination::FilterRules;
use crate::error::{ReplicationError, Result};
use crate::etag::Etag;
use crate::store::{DocumentStore, ReplicatedAttachment, ReplicatedDocument};
use tracing::{debug, trace};

/// A document batch ready to ship.
///
/// Invariants: `records` are etag-ascending and strictly greater than
/// the start etag; `attempted_etag` is the last etag examined (kept or
/// dropped), equal to the start etag only when the stream is exhausted.
#[derive(Debug, Clone)]
pub struct DocumentBatch {
    pub records: Vec<ReplicatedDocument>,
    pub attempted_etag: Etag,
}

/// An attachment batch ready to ship. Same invariants as
/// [`DocumentBatch`].
#[derive(Debug, Clone)]
pub struct AttachmentBatch {
    pub records: Vec<ReplicatedAttachment>,
    pub attempted_etag: Etag,
}

/// Assemble the next document batch after `start`.
pub async fn build_document_batch<S: DocumentStore + ?Sized>(
    store: &S,
    start: Etag,
    filter: &FilterRules,
    server_instance_id: &str,
    limits: &BatchLimits,
) -> Result<DocumentBatch> {
    let mut cursor = start;

    loop {
        let page = store
            .document_page_after(cursor, limits.max_records, limits.max_bytes)
            .await
            .map_err(|e| ReplicationError::Storage(e.to_string()))?;

        let mut merged: Vec<ReplicatedDocument> = page.documents;
        merged.extend(
            page.tombstones
                .into_iter()
                .map(ReplicatedDocument::from_tombstone),
        );
        merged.sort_by_key(|r| r.etag);

        let Some(last) = merged.last() else {
            // Stream exhausted at the cursor: nothing to send, nothing
            // further to advance.
            return Ok(DocumentBatch {
                records: Vec::new(),
                attempted_etag: cursor,
            });
        };
        let last_etag = last.etag;
        let examined = merged.len();

        let kept: Vec<ReplicatedDocument> = merged
            .into_iter()
            .filter(|r| filter.should_replicate(server_instance_id, &r.key, &r.metadata))
            .collect();

        if !kept.is_empty() {
            debug!(
                kept = kept.len(),
                dropped = examined - kept.len(),
                attempted_etag = %last_etag,
                "assembled document batch"
            );
            return Ok(DocumentBatch {
                records: kept,
                attempted_etag: last_etag,
            });
        }

        trace!(
            examined,
            cursor = %last_etag,
            "entire document batch filtered out, advancing"
        );
        cursor = last_etag;
    }
}

/// Assemble the next attachment batch after `start`.
///
/// Payloads come loaded from the store's snapshot; tombstones carry no
/// payload (size 0).
pub async fn build_attachment_batch<S: DocumentStore + ?Sized>(
    store: &S,
    start: Etag,
    filter: &FilterRules,
    server_instance_id: &str,
    limits: &BatchLimits,
) -> Result<AttachmentBatch> {
    let mut cursor = start;

    loop {
        let page = store
            .attachment_page_after(cursor, limits.max_records, limits.max_bytes)
            .await
            .map_err(|e| ReplicationError::Storage(e.to_string()))?;

        let mut merged: Vec<ReplicatedAttachment> = page.attachments;
        merged.extend(
            page.tombstones
                .into_iter()
                .map(ReplicatedAttachment::from_tombstone),
        );
        merged.sort_by_key(|r| r.etag);

        let Some(last) = merged.last() else {
            return Ok(AttachmentBatch {
                records: Vec::new(),
                attempted_etag: cursor,
            });
        };
        let last_etag = last.etag;
        let examined = merged.len();

        let kept: Vec<ReplicatedAttachment> = merged
            .into_iter()
            .filter(|r| filter.should_replicate(server_instance_id, &r.key, &r.metadata))
            .collect();

        if !kept.is_empty() {
            debug!(
                kept = kept.len(),
                dropped = examined - kept.len(),
                attempted_etag = %last_etag,
                "assembled attachment batch"
            );
            return Ok(AttachmentBatch {
                records: kept,
                attempted_etag: last_etag,
            });
        }

        trace!(
            examined,
            cursor = %last_etag,
            "entire attachment batch filtered out, advancing"
        );
        cursor = last_etag;
    }
}
