//! Recording transport double for scenario tests.
//!
//! Records every wire call for assertions. Responses are scripted per
//! destination: the remote cursor it reports, how many document ships
//! fail before succeeding, and an optional gate that holds document
//! ships in flight (for mutual-exclusion scenarios).

use outbound_replication::destination::ReplicationDestination;
use outbound_replication::error::ReplicationError;
use outbound_replication::etag::Etag;
use outbound_replication::store::{ReplicatedAttachment, ReplicatedDocument};
use outbound_replication::transport::{
    BoxFuture, ReplicationTransport, SourceReplicationInformation,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// One recorded wire call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    FetchLastEtag {
        url: String,
    },
    PutLastEtag {
        url: String,
        document_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    },
    ShipDocuments {
        url: String,
        keys: Vec<String>,
        etags: Vec<Etag>,
    },
    ShipAttachments {
        url: String,
        keys: Vec<String>,
    },
    Heartbeat {
        url: String,
    },
}

/// Scripted, recording implementation of [`ReplicationTransport`].
pub struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    remote: Mutex<HashMap<String, SourceReplicationInformation>>,
    doc_ship_failures: Mutex<HashMap<String, usize>>,
    doc_ship_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            remote: Mutex::new(HashMap::new()),
            doc_ship_failures: Mutex::new(HashMap::new()),
            doc_ship_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Script the remote cursor a destination reports.
    pub fn set_remote(&self, url: &str, info: SourceReplicationInformation) {
        self.remote.lock().unwrap().insert(url.to_string(), info);
    }

    /// Make the next `n` document ships to `url` fail with a 503-style
    /// rejection.
    pub fn fail_doc_ships(&self, url: &str, n: usize) {
        self.doc_ship_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), n);
    }

    /// Hold document ships to `url` until [`release_doc_ships`] is
    /// called.
    ///
    /// [`release_doc_ships`]: Self::release_doc_ships
    pub fn hold_doc_ships(&self, url: &str) {
        self.doc_ship_gates
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Release `n` held document ships to `url`.
    pub fn release_doc_ships(&self, url: &str, n: usize) {
        if let Some(gate) = self.doc_ship_gates.lock().unwrap().get(url) {
            gate.add_permits(n);
        }
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RecordedCall::FetchLastEtag { url: u } if u == url))
            .count()
    }

    pub fn doc_ship_count(&self, url: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RecordedCall::ShipDocuments { url: u, .. } if u == url))
            .count()
    }

    pub fn cursor_pushes(&self, url: &str) -> Vec<(Option<Etag>, Option<Etag>)> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                RecordedCall::PutLastEtag {
                    url: u,
                    document_etag,
                    attachment_etag,
                } if u == url => Some((*document_etag, *attachment_etag)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ReplicationTransport for RecordingTransport {
    fn fetch_last_etag(
        &self,
        destination: &ReplicationDestination,
        _current_etag: Etag,
    ) -> BoxFuture<'_, SourceReplicationInformation> {
        let url = destination.effective_url();
        Box::pin(async move {
            self.record(RecordedCall::FetchLastEtag { url: url.clone() });
            Ok(self
                .remote
                .lock()
                .unwrap()
                .get(&url)
                .cloned()
                .unwrap_or(SourceReplicationInformation {
                    last_document_etag: Etag::ZERO,
                    last_attachment_etag: Etag::ZERO,
                    server_instance_id: "recorded-instance".to_string(),
                }))
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
            self.record(RecordedCall::PutLastEtag {
                url,
                document_etag,
                attachment_etag,
            });
            Ok(())
        })
    }

    fn ship_documents(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedDocument],
    ) -> BoxFuture<'_, ()> {
        let url = destination.effective_url();
        let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        let etags: Vec<Etag> = records.iter().map(|r| r.etag).collect();
        Box::pin(async move {
            let gate = self.doc_ship_gates.lock().unwrap().get(&url).cloned();
            if let Some(gate) = gate {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
            }

            self.record(RecordedCall::ShipDocuments {
                url: url.clone(),
                keys,
                etags,
            });

            let mut failures = self.doc_ship_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ReplicationError::BatchRejected {
                        url,
                        message: "status 503 Service Unavailable".to_string(),
                    });
                }
            }
            Ok(())
        })
    }

    fn ship_attachments(
        &self,
        destination: &ReplicationDestination,
        records: &[ReplicatedAttachment],
    ) -> BoxFuture<'_, ()> {
        let url = destination.effective_url();
        let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        Box::pin(async move {
            self.record(RecordedCall::ShipAttachments { url, keys });
            Ok(())
        })
    }

    fn heartbeat(&self, peer_url: &str) -> BoxFuture<'_, ()> {
        let url = peer_url.to_string();
        Box::pin(async move {
            self.record(RecordedCall::Heartbeat { url });
            Ok(())
        })
    }
}
