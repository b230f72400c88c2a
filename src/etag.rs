// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Etags: opaque, monotonic record identifiers.
//!
//! Every document and attachment write is stamped with an [`Etag`].
//! Etags are totally ordered within a stream (documents and attachments
//! have separate streams) and serialize as a 16-byte value:
//!
//! - JSON wire form: 32 lowercase hex characters
//! - BSON wire form: the 16 raw bytes
//!
//! Internally an etag is a `(restarts, changes)` pair: the high half
//! counts storage generations, the low half counts writes within a
//! generation. Comparison is lexicographic on the pair, which matches
//! byte-wise comparison of the big-endian encoding.
//!
//! [`Etag::ZERO`] sorts before the first record ever written.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque monotonic identifier for a record in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Etag {
    restarts: u64,
    changes: u64,
}

impl Etag {
    /// The etag before the first record. Fetching "after zero" yields
    /// the whole stream.
    pub const ZERO: Etag = Etag {
        restarts: 0,
        changes: 0,
    };

    /// Create an etag from its two halves.
    pub const fn new(restarts: u64, changes: u64) -> Self {
        Self { restarts, changes }
    }

    /// Shorthand for an etag in the current (zeroth) generation.
    ///
    /// Mostly useful in tests: `Etag::with_changes(3)` is the third
    /// write of a fresh store.
    pub const fn with_changes(changes: u64) -> Self {
        Self {
            restarts: 0,
            changes,
        }
    }

    /// The generation counter.
    pub const fn restarts(&self) -> u64 {
        self.restarts
    }

    /// The write counter within the generation.
    pub const fn changes(&self) -> u64 {
        self.changes
    }

    /// The next etag in the same generation.
    pub const fn next(&self) -> Self {
        Self {
            restarts: self.restarts,
            changes: self.changes + 1,
        }
    }

    /// Encode as 16 big-endian bytes (the BSON wire form).
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.restarts.to_be_bytes());
        out[8..].copy_from_slice(&self.changes.to_be_bytes());
        out
    }

    /// Decode from 16 big-endian bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Self {
            restarts: u64::from_be_bytes(hi),
            changes: u64::from_be_bytes(lo),
        }
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

/// Error parsing an etag from its hex wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEtagError(String);

impl fmt::Display for ParseEtagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid etag: {}", self.0)
    }
}

impl std::error::Error for ParseEtagError {}

impl FromStr for Etag {
    type Err = ParseEtagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ParseEtagError(e.to_string()))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ParseEtagError(format!("expected 16 bytes, got {} hex chars", s.len())))?;
        Ok(Etag::from_bytes(arr))
    }
}

impl Serialize for Etag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
