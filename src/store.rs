// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local storage integration trait.
//!
//! Defines the interface the replication engine needs from the local
//! document store. The host database provides an implementation; the
//! engine only ever *reads* the document and attachment streams and
//! *writes* its own bookkeeping documents (failure info under
//! `replication/destinations-failure/`).
//!
//! # Snapshot Semantics
//!
//! [`DocumentStore::document_page_after`] returns live documents **and**
//! document tombstones from a single transactional snapshot. Returning
//! both from one call is what stops a document deleted between two reads
//! from showing up twice in a batch. The attachment page works the same
//! way, with binary payloads loaded inside the same snapshot.
//!
//! # Work Notifications
//!
//! `put()` and `delete()` exist for replication bookkeeping documents and
//! must **not** raise work notifications — otherwise the engine would
//! wake itself by recording its own failures. Only external client
//! writes signal the [`WorkContext`](crate::work::WorkContext).

use crate::etag::Etag;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for storage operations.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// Metadata key marking a record as deleted on the wire.
pub const METADATA_DELETED: &str = "deleted";

/// A document record as it travels to a peer.
///
/// Wire shape: `{ key, etag, @metadata, ...payload fields... }`.
/// Tombstones have an empty payload and metadata carrying the deletion
/// marker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReplicatedDocument {
    /// Document key.
    pub key: String,
    /// Etag of the write that produced this record.
    pub etag: Etag,
    /// Document metadata.
    #[serde(rename = "@metadata")]
    pub metadata: Map<String, Value>,
    /// Document body, flattened into the top-level object.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ReplicatedDocument {
    /// Build the wire record for a tombstone: empty body, original
    /// metadata plus the deletion marker.
    pub fn from_tombstone(tombstone: Tombstone) -> Self {
        let mut metadata = tombstone.metadata;
        metadata.insert(METADATA_DELETED.to_string(), Value::Bool(true));
        Self {
            key: tombstone.key,
            etag: tombstone.etag,
            metadata,
            data: Map::new(),
        }
    }

    /// Check if this record marks a deletion.
    pub fn is_deleted(&self) -> bool {
        self.metadata
            .get(METADATA_DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Approximate payload size in bytes (for the batch byte budget).
    pub fn approximate_size(&self) -> u64 {
        serde_json::to_string(&self.data)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }
}

/// A deletion marker in a tombstone list.
///
/// Tombstones carry their own etag in the same ordering as live writes,
/// so a merged doc+tombstone batch stays etag-ordered.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tombstone {
    /// Key of the deleted record.
    pub key: String,
    /// Etag of the delete.
    pub etag: Etag,
    /// Metadata captured at deletion time.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// An attachment record as it travels to a peer.
///
/// Tombstones have empty `data` (size 0).
#[derive(Debug, Clone)]
pub struct ReplicatedAttachment {
    /// Attachment key.
    pub key: String,
    /// Etag of the write that produced this record.
    pub etag: Etag,
    /// Attachment metadata.
    pub metadata: Map<String, Value>,
    /// Binary payload; empty for tombstones.
    pub data: Vec<u8>,
}

impl ReplicatedAttachment {
    /// Build the wire record for an attachment tombstone.
    pub fn from_tombstone(tombstone: Tombstone) -> Self {
        let mut metadata = tombstone.metadata;
        metadata.insert(METADATA_DELETED.to_string(), Value::Bool(true));
        Self {
            key: tombstone.key,
            etag: tombstone.etag,
            metadata,
            data: Vec::new(),
        }
    }
}

/// One transactional snapshot of the document stream after an etag.
#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    /// Live documents, etag-ascending.
    pub documents: Vec<ReplicatedDocument>,
    /// Document tombstones, etag-ascending.
    pub tombstones: Vec<Tombstone>,
}

/// One transactional snapshot of the attachment stream after an etag.
#[derive(Debug, Clone, Default)]
pub struct AttachmentPage {
    /// Attachments with payloads loaded, etag-ascending.
    pub attachments: Vec<ReplicatedAttachment>,
    /// Attachment tombstones, etag-ascending.
    pub tombstones: Vec<Tombstone>,
}

/// A bookkeeping document read back from the store.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    /// Document key.
    pub key: String,
    /// Current etag of the document.
    pub etag: Etag,
    /// Document body.
    pub data: Value,
}

/// Trait defining what the engine needs from the local store.
///
/// The host database provides an implementation; [`MemoryStore`] is a
/// reference implementation used by the test suite and standalone mode.
pub trait DocumentStore: Send + Sync + 'static {
    /// Read live documents and document tombstones after `after`, in one
    /// transactional snapshot. At most `max_records` of each, with the
    /// documents bounded by `max_bytes` of payload (always at least one
    /// document if any exists).
    fn document_page_after(
        &self,
        after: Etag,
        max_records: usize,
        max_bytes: u64,
    ) -> BoxFuture<'_, DocumentPage>;

    /// Read attachments (payloads included) and attachment tombstones
    /// after `after`, in one transactional snapshot.
    fn attachment_page_after(
        &self,
        after: Etag,
        max_records: usize,
        max_bytes: u64,
    ) -> BoxFuture<'_, AttachmentPage>;

    /// The most recent document etag (informational; sent to peers as
    /// `currentEtag`).
    fn most_recent_document_etag(&self) -> BoxFuture<'_, Etag>;

    /// Read a bookkeeping document.
    fn get(&self, key: &str) -> BoxFuture<'_, Option<StoredDocument>>;

    /// Write a bookkeeping document. Must not raise work notifications.
    fn put(&self, key: &str, document: Value) -> BoxFuture<'_, ()>;

    /// Delete a bookkeeping document. Returns whether it existed.
    /// Must not raise work notifications.
    fn delete(&self, key: &str) -> BoxFuture<'_, bool>;

    /// Page through bookkeeping documents whose key starts with
    /// `prefix`, ordered by key, skipping `start` and taking `take`.
    fn documents_starting_with(
        &self,
        prefix: &str,
        start: usize,
        take: usize,
    ) -> BoxFuture<'_, Vec<StoredDocument>>;

    /// The unique id of this storage instance (`dbid` on the wire).
    fn storage_id(&self) -> &str;

    /// This node's public URL (`from` on the wire).
    fn server_url(&self) -> &str;
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    documents: Vec<ReplicatedDocument>,
    doc_tombstones: Vec<Tombstone>,
    attachments: Vec<ReplicatedAttachment>,
    attachment_tombstones: Vec<Tombstone>,
    bookkeeping: std::collections::BTreeMap<String, StoredDocument>,
    next_change: u64,
    next_bookkeeping_change: u64,
}

impl MemoryInner {
    fn next_etag(&mut self) -> Etag {
        self.next_change += 1;
        Etag::with_changes(self.next_change)
    }

    // Bookkeeping documents live outside the replication streams, so
    // their versions come from a separate counter.
    fn next_bookkeeping_etag(&mut self) -> Etag {
        self.next_bookkeeping_change += 1;
        Etag::with_changes(self.next_bookkeeping_change)
    }
}

/// In-memory store for tests and standalone mode.
///
/// Documents and attachments are appended with monotonically increasing
/// etags; bookkeeping documents live in a separate keyspace and never
/// appear in the replication streams.
pub struct MemoryStore {
    inner: tokio::sync::RwLock<MemoryInner>,
    storage_id: String,
    server_url: String,
}

impl MemoryStore {
    /// Create an empty store with the given node identity.
    pub fn new(storage_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(MemoryInner::default()),
            storage_id: storage_id.into(),
            server_url: server_url.into(),
        }
    }

    /// Append a document write; returns its etag.
    pub async fn write_document(&self, key: &str, data: Value) -> Etag {
        self.write_document_with_metadata(key, data, Map::new())
            .await
    }

    /// Append a document write with explicit metadata; returns its etag.
    pub async fn write_document_with_metadata(
        &self,
        key: &str,
        data: Value,
        metadata: Map<String, Value>,
    ) -> Etag {
        let mut inner = self.inner.write().await;
        let etag = inner.next_etag();
        let data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        inner.documents.push(ReplicatedDocument {
            key: key.to_string(),
            etag,
            metadata,
            data,
        });
        etag
    }

    /// Append a document tombstone; returns its etag.
    pub async fn write_document_tombstone(&self, key: &str) -> Etag {
        let mut inner = self.inner.write().await;
        let etag = inner.next_etag();
        inner.doc_tombstones.push(Tombstone {
            key: key.to_string(),
            etag,
            metadata: Map::new(),
        });
        etag
    }

    /// Append an attachment write; returns its etag.
    pub async fn write_attachment(&self, key: &str, data: Vec<u8>) -> Etag {
        let mut inner = self.inner.write().await;
        let etag = inner.next_etag();
        inner.attachments.push(ReplicatedAttachment {
            key: key.to_string(),
            etag,
            metadata: Map::new(),
            data,
        });
        etag
    }

    /// Append an attachment tombstone; returns its etag.
    pub async fn write_attachment_tombstone(&self, key: &str) -> Etag {
        let mut inner = self.inner.write().await;
        let etag = inner.next_etag();
        inner.attachment_tombstones.push(Tombstone {
            key: key.to_string(),
            etag,
            metadata: Map::new(),
        });
        etag
    }
}

impl DocumentStore for MemoryStore {
    fn document_page_after(
        &self,
        after: Etag,
        max_records: usize,
        max_bytes: u64,
    ) -> BoxFuture<'_, DocumentPage> {
        Box::pin(async move {
            let inner = self.inner.read().await;

            let mut documents = Vec::new();
            let mut bytes = 0u64;
            for doc in inner.documents.iter().filter(|d| d.etag > after) {
                if documents.len() >= max_records {
                    break;
                }
                let size = doc.approximate_size();
                if !documents.is_empty() && bytes + size > max_bytes {
                    break;
                }
                bytes += size;
                documents.push(doc.clone());
            }

            let tombstones: Vec<Tombstone> = inner
                .doc_tombstones
                .iter()
                .filter(|t| t.etag > after)
                .take(max_records)
                .cloned()
                .collect();

            Ok(DocumentPage {
                documents,
                tombstones,
            })
        })
    }

    fn attachment_page_after(
        &self,
        after: Etag,
        max_records: usize,
        max_bytes: u64,
    ) -> BoxFuture<'_, AttachmentPage> {
        Box::pin(async move {
            let inner = self.inner.read().await;

            let mut attachments = Vec::new();
            let mut bytes = 0u64;
            for att in inner.attachments.iter().filter(|a| a.etag > after) {
                if attachments.len() >= max_records {
                    break;
                }
                let size = att.data.len() as u64;
                if !attachments.is_empty() && bytes + size > max_bytes {
                    break;
                }
                bytes += size;
                attachments.push(att.clone());
            }

            let tombstones: Vec<Tombstone> = inner
                .attachment_tombstones
                .iter()
                .filter(|t| t.etag > after)
                .take(max_records)
                .cloned()
                .collect();

            Ok(AttachmentPage {
                attachments,
                tombstones,
            })
        })
    }

    fn most_recent_document_etag(&self) -> BoxFuture<'_, Etag> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let doc_max = inner.documents.last().map(|d| d.etag).unwrap_or(Etag::ZERO);
            let tomb_max = inner
                .doc_tombstones
                .last()
                .map(|t| t.etag)
                .unwrap_or(Etag::ZERO);
            Ok(doc_max.max(tomb_max))
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Option<StoredDocument>> {
        let key = key.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.bookkeeping.get(&key).cloned())
        })
    }

    fn put(&self, key: &str, document: Value) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let etag = inner.next_bookkeeping_etag();
            inner.bookkeeping.insert(
                key.clone(),
                StoredDocument {
                    key,
                    etag,
                    data: document,
                },
            );
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            Ok(inner.bookkeeping.remove(&key).is_some())
        })
    }

    fn documents_starting_with(
        &self,
        prefix: &str,
        start: usize,
        take: usize,
    ) -> BoxFuture<'_, Vec<StoredDocument>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .bookkeeping
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .skip(start)
                .take(take)
                .map(|(_, doc)| doc.clone())
                .collect())
        })
    }

    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn server_url(&self) -> &str {
        &self.server_url
    }
}
