//! Error types for aclctl-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the storage traits.
///
/// Backends map their native failures onto these variants so callers can
/// branch on `Conflict` (retry) versus everything else.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The addressed record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic concurrency check failed; re-read and retry
    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    /// A status change the record's lifecycle does not allow
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// The device lease is owned by someone else
    #[error("lease on device {device_id} is held by {holder}")]
    LeaseHeld { device_id: String, holder: String },

    /// Malformed content digest
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Record could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True when the caller should re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
