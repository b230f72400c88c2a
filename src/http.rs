// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP implementation of the peer transport.
//!
//! Speaks the replication wire contract:
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | GET | `/replication/lastEtag` | – |
//! | PUT | `/replication/lastEtag` | – |
//! | POST | `/replication/replicateDocs` | JSON array of documents |
//! | POST | `/replication/replicateAttachments` | BSON array + `Attachment-Ids` header |
//! | POST | `/replication/heartbeat` | – |
//!
//! Every request carries `from={our url}` (and `dbid={our storage id}`
//! where the peer keys cursor state by source). Credentials come from
//! the destination: basic auth (optionally `domain\user`) or an api-key
//! header.
//!
//! Error mapping: connection failures and unexpected statuses become
//! [`ReplicationError::Http`]; 400/404 from the lastEtag endpoint
//! becomes [`ReplicationError::ReplicationNotEnabled`]; a rejected
//! batch becomes [`ReplicationError::BatchRejected`] with the `Error`
//! field extracted when the body is a JSON object carrying one.

use crate::config::RequestConfig;
use crate::destination::{Credentials, ReplicationDestination};
use crate::error::{ReplicationError, Result};
use crate::etag::Etag;
use crate::metrics;
use crate::store::{ReplicatedAttachment, ReplicatedDocument};
use crate::transport::{BoxFuture, ReplicationTransport, SourceReplicationInformation};
use bson::spec::BinarySubtype;
use bson::{Binary, Bson};
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Instant;
use tracing::debug;

/// Header naming the attachment keys in a shipped batch, for the peer's
/// logging and dedup.
pub const ATTACHMENT_IDS_HEADER: &str = "Attachment-Ids";

/// Header carrying an api key, when the destination uses one.
pub const API_KEY_HEADER: &str = "Api-Key";

/// Reqwest-backed [`ReplicationTransport`].
///
/// The client is cheap to clone and stateless; one instance serves all
/// destinations.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    server_url: String,
    storage_id: String,
}

impl HttpTransport {
    /// Build a transport for this node.
    ///
    /// `server_url` and `storage_id` identify us to peers (`from` and
    /// `dbid` on the wire).
    pub fn new(
        config: &RequestConfig,
        server_url: impl Into<String>,
        storage_id: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| ReplicationError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            server_url: server_url.into(),
            storage_id: storage_id.into(),
        })
    }

    fn apply_auth(
        request: RequestBuilder,
        destination: &ReplicationDestination,
    ) -> RequestBuilder {
        match destination.credentials() {
            Credentials::Anonymous => request,
            Credentials::Basic {
                username,
                password,
                domain,
            } => {
                let user = match domain {
                    Some(domain) => format!("{}\\{}", domain, username),
                    None => username,
                };
                request.basic_auth(user, Some(password))
            }
            Credentials::ApiKey(key) => request.header(API_KEY_HEADER, key),
        }
    }
}

/// Pull a human-readable error out of a rejected response body.
///
/// If the body is a JSON object with a string `Error` field, that text
/// is the message; otherwise the raw body, or the status line when the
/// body is empty.
pub fn extract_error_text(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(text) = value.get("Error").and_then(|e| e.as_str()) {
            return text.to_string();
        }
    }
    if body.trim().is_empty() {
        format!("status {}", status)
    } else {
        format!("status {}: {}", status, body)
    }
}

/// Comma-separated value for the `Attachment-Ids` header.
pub fn attachment_ids_header(records: &[ReplicatedAttachment]) -> String {
    records
        .iter()
        .map(|r| r.key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Encode an attachment batch as a BSON array.
///
/// BSON has no top-level array, so the batch is a document with
/// ascending numeric keys — the same layout BSON uses for embedded
/// arrays.
pub fn encode_attachment_batch(records: &[ReplicatedAttachment]) -> Result<Vec<u8>> {
    let mut batch = bson::Document::new();
    for (index, record) in records.iter().enumerate() {
        batch.insert(index.to_string(), attachment_to_bson(record)?);
    }
    bson::to_vec(&batch)
        .map_err(|e| ReplicationError::Internal(format!("BSON encoding failed: {}", e)))
}

fn attachment_to_bson(record: &ReplicatedAttachment) -> Result<bson::Document> {
    let metadata = bson::to_bson(&record.metadata)
        .map_err(|e| ReplicationError::Internal(format!("BSON encoding failed: {}", e)))?;
    Ok(bson::doc! {
        "@id": record.key.as_str(),
        "@etag": Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: record.etag.to_bytes().to_vec(),
        }),
        "@metadata": metadata,
        "data": Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: record.data.clone(),
        }),
    })
}

impl ReplicationTransport for HttpTransport {
    fn fetch_last_etag(
        &self,
        destination: &ReplicationDestination,
        current_etag: Etag,
    ) -> BoxFuture<'_, SourceReplicationInformation> {
        let destination = destination.clone();
        Box::pin(async move {
            let url = destination.effective_url();
            let start = Instant::now();

            let current = current_etag.to_string();
            let request = self
                .client
                .get(format!("{}/replication/lastEtag", url))
                .query(&[
                    ("from", self.server_url.as_str()),
                    ("currentEtag", current.as_str()),
                    ("dbid", self.storage_id.as_str()),
                ]);
            let request = Self::apply_auth(request, &destination);

            let response = request
                .send()
                .await
                .map_err(|e| ReplicationError::http(&url, e.to_string()))?;

            metrics::record_peer_request_latency(&url, "lastEtag", start.elapsed());

            match response.status() {
                status if status.is_success() => {
                    let info = response
                        .json::<SourceReplicationInformation>()
                        .await
                        .map_err(|e| {
                            ReplicationError::http(&url, format!("bad lastEtag body: {}", e))
                        })?;
                    debug!(
                        url = %url,
                        last_document_etag = %info.last_document_etag,
                        last_attachment_etag = %info.last_attachment_etag,
                        "fetched remote cursor"
                    );
                    Ok(info)
                }
                StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                    Err(ReplicationError::ReplicationNotEnabled { url })
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    Err(ReplicationError::http(&url, extract_error_text(status, &body)))
                }
            }
        })
    }

    fn put_last_etag(
        &self,
        destination: &ReplicationDestination,
        document_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> BoxFuture<'_, ()> {
        let destination = destination.clone();
        Box::pin(async move {
            let url = destination.effective_url();

            let mut query: Vec<(&str, String)> = vec![
                ("from", self.server_url.clone()),
                ("dbid", self.storage_id.clone()),
            ];
            if let Some(etag) = document_etag {
                query.push(("docEtag", etag.to_string()));
            }
            if let Some(etag) = attachment_etag {
                query.push(("attachmentEtag", etag.to_string()));
            }

            let request = self
                .client
                .put(format!("{}/replication/lastEtag", url))
                .query(&query);
            let request = Self::apply_auth(request, &destination);

            let response = request
                .send()
                .await
                .map_err(|e| ReplicationError::http(&url, e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                metrics::record_cursor_push(&url);
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(ReplicationError::http(&url, extract_error_text(status, &body)))
            }
        })
    }

    fn ship_documents(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedDocument],
    ) -> BoxFuture<'_, ()> {
        let destination = destination.clone();
        let body = serde_json::to_vec(records);
        let count = records.len();
        Box::pin(async move {
            let url = destination.effective_url();
            let body = body
                .map_err(|e| ReplicationError::Internal(format!("JSON encoding failed: {}", e)))?;
            let bytes = body.len();
            let start = Instant::now();

            let request = self
                .client
                .post(format!("{}/replication/replicateDocs", url))
                .query(&[("from", self.server_url.as_str())])
                .header(CONTENT_TYPE, "application/json")
                .body(body);
            let request = Self::apply_auth(request, &destination);

            let response = request
                .send()
                .await
                .map_err(|e| ReplicationError::http(&url, e.to_string()))?;

            metrics::record_peer_request_latency(&url, "replicateDocs", start.elapsed());

            let status = response.status();
            if status.is_success() {
                debug!(url = %url, count, bytes, "shipped document batch");
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(ReplicationError::BatchRejected {
                    url,
                    message: extract_error_text(status, &body),
                })
            }
        })
    }

    fn ship_attachments(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedAttachment],
    ) -> BoxFuture<'_, ()> {
        let destination = destination.clone();
        let body = encode_attachment_batch(records);
        let ids = attachment_ids_header(records);
        let count = records.len();
        Box::pin(async move {
            let url = destination.effective_url();
            let body = body?;
            let bytes = body.len();
            let start = Instant::now();

            let request = self
                .client
                .post(format!("{}/replication/replicateAttachments", url))
                .query(&[("from", self.server_url.as_str())])
                .header(ATTACHMENT_IDS_HEADER, ids)
                .header(CONTENT_TYPE, "application/bson")
                .body(body);
            let request = Self::apply_auth(request, &destination);

            let response = request
                .send()
                .await
                .map_err(|e| ReplicationError::http(&url, e.to_string()))?;

            metrics::record_peer_request_latency(&url, "replicateAttachments", start.elapsed());

            let status = response.status();
            if status.is_success() {
                debug!(url = %url, count, bytes, "shipped attachment batch");
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(ReplicationError::BatchRejected {
                    url,
                    message: extract_error_text(status, &body),
                })
            }
        })
    }

    fn heartbeat(&self, peer_url: &str) -> BoxFuture<'_, ()> {
        let peer_url = peer_url.trim_end_matches('/').to_string();
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/replication/heartbeat", peer_url))
                .query(&[("from", self.server_url.as_str())])
                .send()
                .await
                .map_err(|e| ReplicationError::http(&peer_url, e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(ReplicationError::http(
                    &peer_url,
                    format!("heartbeat rejected with status {}", status),
                ))
            }
        })
    }
}
