//! Error types shared across the Ontograph workspace.

use serde_json::Value;
use thiserror::Error;

use crate::schema::TypeSchemaDiff;

/// Errors surfaced by storage backends, the session runtime and the
/// migration engine.
#[derive(Error, Debug)]
pub enum OntoError {
    /// Object-store head missing; the store must be initialized first.
    #[error("storage is not initialized: {0}")]
    UninitializedStorage(String),

    /// Write lock not acquired within the timeout.
    #[error("write lock not acquired within {timeout_ms}ms")]
    LockContention { timeout_ms: u64 },

    /// A write or handler commit was attempted after its lease window.
    #[error("lease expired")]
    LeaseExpired,

    /// A concurrent writer advanced the head between plan and publish.
    #[error("head moved by a concurrent writer; re-snapshot and retry")]
    HeadMismatch,

    /// Delta rows exceed the configured batch limit.
    #[error("commit of {actual} rows exceeds max_batch_size {limit}")]
    BatchSizeExceeded { actual: usize, limit: usize },

    /// Stored schema versions no longer match the validated snapshot.
    #[error("stored schemas drifted for {} type(s); migration required", .0.len())]
    SchemaOutdated(Vec<TypeSchemaDiff>),

    /// Migration token is stale or malformed.
    #[error("migration token rejected: {0}")]
    MigrationToken(String),

    /// Types with data are missing upgraders for the listed version gaps.
    #[error("missing upgraders: {0:?}")]
    MissingUpgraders(std::collections::BTreeMap<String, Vec<u32>>),

    /// A row rewrite failed during migration apply.
    #[error("migration failed for {type_name} '{key}': {message}")]
    Migration {
        type_name: String,
        key: String,
        message: String,
        /// Pre-migration field payload of the failing row.
        old_fields: Value,
    },

    /// Commit chain exceeded `max_commit_chain_depth`.
    #[error("commit chain depth {depth} exceeds limit {limit}")]
    CommitChainDepth { depth: u32, limit: u32 },

    /// Event chain exceeded `max_event_chain_depth`.
    #[error("event chain depth {depth} exceeds limit {limit}")]
    EventLoopLimit { depth: u32, limit: u32 },

    /// Invalid handler registration (duplicate id, bad subscription).
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid typed value (bad instance key, payload not an object, ...).
    #[error("invalid model value: {0}")]
    Model(String),

    /// Invalid filter path or expression.
    #[error("invalid filter: {0}")]
    Filter(String),

    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    Cron(String),

    /// Backend-reported failure that does not fit a specific kind.
    #[error("storage backend error in {op}: {message}")]
    StorageBackend { op: String, message: String },

    /// Serialization failure at a storage or event boundary.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OntoError {
    /// Shorthand for backend failures.
    pub fn backend(op: impl Into<String>, message: impl std::fmt::Display) -> Self {
        OntoError::StorageBackend {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// Whether a bounded retry with backoff is expected to help.
    ///
    /// Mirrors the `ConcurrentWriteError` umbrella: lock, head and lease
    /// failures are the only retryable classes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OntoError::LockContention { .. } | OntoError::HeadMismatch | OntoError::LeaseExpired
        )
    }
}

impl From<serde_json::Error> for OntoError {
    fn from(err: serde_json::Error) -> Self {
        OntoError::Serialization(err.to_string())
    }
}

/// Result type for Ontograph operations.
pub type Result<T> = std::result::Result<T, OntoError>;
