//! Replication destinations: configuration, identity, and filters.
//!
//! Destinations are read from the `replication/destinations` document in
//! local storage on **every** scheduler cycle, so the destination list
//! is hot-reloadable. A single malformed entry is skipped with an error
//! log; it must not disable replication for the rest.
//!
//! # Identity
//!
//! A destination is identified by its effective URL — the configured
//! `url` plus an optional `/databases/<name>` segment. Equality is ASCII
//! case-insensitive; the failure tracker and busy-flag map key on the
//! lowercased form.

use crate::error::Result;
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

/// Storage key of the replication configuration document.
pub const DESTINATIONS_KEY: &str = "replication/destinations";

/// Key prefix of the engine's own bookkeeping documents. Records under
/// this prefix never replicate.
pub const INTERNAL_KEY_PREFIX: &str = "replication/";

/// Metadata key that excludes a record from replication.
pub const METADATA_SKIP_REPLICATION: &str = "not-for-replication";

/// What the receiving peer should do with records we forwarded from a
/// third node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitiveReplicationBehavior {
    /// Ship only records written locally.
    #[default]
    None,
    /// Also forward records that arrived from other peers.
    Forward,
}

/// Per-destination record filter.
///
/// A record ships only if its key passes the prefix rules. Regardless of
/// the rules, internal bookkeeping keys and records whose metadata
/// carries [`METADATA_SKIP_REPLICATION`] never ship. Filtered-out
/// records still advance the destination's cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRules {
    /// If non-empty, only keys with one of these prefixes ship.
    #[serde(default)]
    pub include_prefixes: Vec<String>,

    /// Keys with one of these prefixes never ship.
    #[serde(default)]
    pub exclude_prefixes: Vec<String>,
}

impl FilterRules {
    /// Decide whether a record ships to this destination.
    ///
    /// `_server_instance_id` is the receiving peer's instance id, passed
    /// through so stateful filters can key per-destination state on it.
    pub fn should_replicate(
        &self,
        _server_instance_id: &str,
        key: &str,
        metadata: &Map<String, Value>,
    ) -> bool {
        if key.starts_with(INTERNAL_KEY_PREFIX) {
            return false;
        }
        if metadata
            .get(METADATA_SKIP_REPLICATION)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return false;
        }
        if self.exclude_prefixes.iter().any(|p| key.starts_with(p)) {
            return false;
        }
        if !self.include_prefixes.is_empty()
            && !self.include_prefixes.iter().any(|p| key.starts_with(p))
        {
            return false;
        }
        true
    }
}

/// Credentials attached to outbound requests for one destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// No authentication.
    Anonymous,
    /// HTTP basic auth, optionally domain-qualified
    /// (`domain\username`).
    Basic {
        username: String,
        password: String,
        domain: Option<String>,
    },
    /// API key header.
    ApiKey(String),
}

/// A single configured replication destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationDestination {
    /// Base URL of the peer node.
    pub url: String,

    /// Optional target database on the peer.
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,

    /// Forwarding behavior for records that arrived from other peers.
    #[serde(default)]
    pub transitive_replication: TransitiveReplicationBehavior,

    /// Disabled destinations are skipped entirely.
    #[serde(default)]
    pub disabled: bool,

    /// Per-destination record filter.
    #[serde(default)]
    pub filter: FilterRules,
}

impl ReplicationDestination {
    /// A plain destination with no credentials or filter.
    pub fn for_testing(url: &str) -> Self {
        Self {
            url: url.to_string(),
            database: None,
            username: None,
            password: None,
            domain: None,
            api_key: None,
            transitive_replication: TransitiveReplicationBehavior::None,
            disabled: false,
            filter: FilterRules::default(),
        }
    }

    /// The effective URL: `url[/databases/<name>]`, no trailing slash.
    pub fn effective_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        match &self.database {
            Some(db) => format!("{}/databases/{}", base, db),
            None => base.to_string(),
        }
    }

    /// The lowercased effective URL, used as the identity key in the
    /// failure tracker and busy-flag map.
    pub fn identity(&self) -> String {
        self.effective_url().to_ascii_lowercase()
    }

    /// Case-insensitive URL comparison.
    pub fn matches_url(&self, other: &str) -> bool {
        self.effective_url().eq_ignore_ascii_case(other)
    }

    /// The credentials for outbound requests.
    pub fn credentials(&self) -> Credentials {
        if let Some(api_key) = &self.api_key {
            return Credentials::ApiKey(api_key.clone());
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
                domain: self.domain.clone(),
            },
            _ => Credentials::Anonymous,
        }
    }
}

/// Shape of the `replication/destinations` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationDocument {
    #[serde(default)]
    pub destinations: Vec<Value>,
}

/// Load the current destination snapshot from local storage.
///
/// Absent or undeserializable configuration yields an empty list;
/// individual malformed entries are skipped so one bad destination
/// cannot take down the others.
pub async fn load_destinations<S: DocumentStore + ?Sized>(
    store: &S,
) -> Result<Vec<ReplicationDestination>> {
    let doc = match store.get(DESTINATIONS_KEY).await {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            debug!("no replication destinations document");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(crate::error::ReplicationError::Storage(e.to_string()));
        }
    };

    let parsed: ReplicationDocument = match serde_json::from_value(doc.data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "replication destinations document is not deserializable");
            return Ok(Vec::new());
        }
    };

    let mut destinations = Vec::with_capacity(parsed.destinations.len());
    for (index, entry) in parsed.destinations.into_iter().enumerate() {
        match serde_json::from_value::<ReplicationDestination>(entry) {
            Ok(dest) if dest.disabled => {
                debug!(url = %dest.url, "skipping disabled destination");
            }
            Ok(dest) => destinations.push(dest),
            Err(e) => {
                error!(index, error = %e, "skipping malformed replication destination");
            }
        }
    }

    Ok(destinations)
}

/// Escape a destination URL for use in a storage key:
/// strip the scheme, drop `/` and `:`, percent-encode the rest.
pub fn escape_destination_url(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .replace(['/', ':'], "");

    let mut out = String::with_capacity(stripped.len());
    for byte in stripped.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
