//! Newtype identifiers used across the engine.
//!
//! Plain `String` newtypes: cheap to clone, transparent in documents, and
//! impossible to mix up in signatures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Station identifier — the opaque UUID-like string from the master data
/// feed. Never parsed, only compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationId(pub String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        StationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single price report inside a bucket's price list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    /// Fresh random id, 12 hex chars.
    pub fn random() -> Self {
        let bytes: [u8; 6] = rand::thread_rng().gen();
        RecordId(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
