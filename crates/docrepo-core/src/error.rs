//! Error handling
//!
//! Two layers of typed errors:
//! - `StoreError`: failures reported by the document store backend
//! - `RepoError`: failures surfaced by the store handle and repositories,
//!   either wrapper-level guards or store failures passed through

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a document store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// A document with the same `_id` already exists
    #[error("Duplicate key in collection '{collection}': {key}")]
    DuplicateKey { collection: String, key: String },

    /// The store refuses batches without any operations
    #[error("{operation} requires at least one document or operation")]
    EmptyBatch { operation: &'static str },

    /// A write tried to change a field that cannot change (e.g. `_id`)
    #[error("Field '{field}' is immutable")]
    ImmutableField { field: String },

    /// The filter, update or pipeline is malformed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// An operator or stage the backend does not implement
    #[error("Unsupported operator: {0}")]
    Unsupported(String),

    /// The store did not answer
    #[error("Store unreachable: {0}")]
    Unreachable(String),

    /// An internal lock was poisoned by a panicking writer
    #[error("Store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// Error raised by the underlying driver
    #[error("Driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for backend operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store handle and repositories
#[derive(Error, Debug)]
pub enum RepoError {
    /// The store could not be reached while opening the handle
    #[error("Failed to connect to '{uri}': {reason}")]
    Connection { uri: String, reason: String },

    /// Releasing the connection did not complete cleanly
    #[error("Failed to disconnect from database '{database}': {source}")]
    Disconnect {
        database: String,
        #[source]
        source: StoreError,
    },

    /// A caller-supplied argument violates a safety precondition
    #[error("{operation}: {reason}")]
    Validation {
        operation: &'static str,
        reason: String,
    },

    /// No document matched a single-result query
    #[error("No document in '{collection}' matched the filter")]
    NotFound { collection: String },

    /// Store failure annotated with the repository operation that caused it
    #[error("{operation}: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// Store failure passed through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A document could not be encoded as BSON
    #[error("Failed to serialize document: {0}")]
    Serialization(#[from] bson::ser::Error),

    /// A stored document could not be decoded into the requested type
    #[error("Failed to deserialize document: {0}")]
    Deserialization(#[from] bson::de::Error),

    /// The execution context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The execution context deadline passed before the call completed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Opening the handle took longer than the configured timeout
    #[error("Timed out after {timeout:?} connecting to '{uri}'")]
    ConnectTimeout { uri: String, timeout: Duration },
}

impl RepoError {
    /// Whether this error means a single-result query matched nothing
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound { .. })
    }

    /// Whether this error came from the execution context rather than the store
    pub fn is_context_error(&self) -> bool {
        matches!(self, RepoError::Cancelled | RepoError::DeadlineExceeded)
    }

    /// Whether the store handle failed to come up
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RepoError::Connection { .. } | RepoError::ConnectTimeout { .. }
        )
    }
}

/// Result type for repository and store handle operations
pub type RepoResult<T> = Result<T, RepoError>;
