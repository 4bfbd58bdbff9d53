//! Metadata error types

use crate::entity::EntityKind;
use thiserror::Error;

/// Result type for metadata operations
pub type Result<T> = std::result::Result<T, MetaError>;

/// Metadata errors
#[derive(Debug, Error)]
pub enum MetaError {
    // ==================== Lookup Errors ====================
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },

    #[error("no {kind} matches {filter}")]
    NoMatch { kind: EntityKind, filter: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: u64 },

    // ==================== Concurrency Errors ====================
    #[error("version conflict on {kind} {id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        kind: EntityKind,
        id: u64,
        expected: i32,
        actual: Option<i32>,
    },

    // ==================== Storage Errors ====================
    #[error("local store error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Coordinator Errors ====================
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("no free machine index left for {0}")]
    MachineIndexExhausted(String),

    #[error("reconciliation failed for {failed}: {first}")]
    ReconciliationFailed {
        /// Kinds that could not be reconciled, comma separated
        failed: String,
        first: Box<MetaError>,
    },

    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MetaError {
    /// Check if this error reports an absent record
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound { .. } | MetaError::NoMatch { .. })
    }

    /// Check if this error is a lost compare-and-swap race
    pub fn is_conflict(&self) -> bool {
        matches!(self, MetaError::VersionConflict { .. })
    }

    /// Check if the operation may succeed when retried with fresh state
    pub fn is_retriable(&self) -> bool {
        match self {
            MetaError::VersionConflict { .. } | MetaError::CoordinatorUnavailable(_) => true,
            MetaError::ReconciliationFailed { first, .. } => first.is_retriable(),
            _ => false,
        }
    }

    /// Check if this error leaves the local store unusable
    pub fn is_fatal(&self) -> bool {
        match self {
            MetaError::Storage(_) | MetaError::Io(_) => true,
            MetaError::ReconciliationFailed { first, .. } => first.is_fatal(),
            _ => false,
        }
    }
}

macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for MetaError {
                fn from(e: $ty) -> Self {
                    MetaError::Storage(e.to_string())
                }
            }
        )*
    };
}

storage_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<prost::DecodeError> for MetaError {
    fn from(e: prost::DecodeError) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

impl From<mysql_async::Error> for MetaError {
    fn from(e: mysql_async::Error) -> Self {
        MetaError::CoordinatorUnavailable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MetaError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MetaError::CoordinatorUnavailable("request timed out".to_string())
    }
}
