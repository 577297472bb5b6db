//! Error types for fleet-sync operations.
//!
//! `StoreError` is what a store backend reports; `SyncError` is what a
//! binding hands to its consumer. Neither is ever thrown past a binding:
//! consumers receive them as values through `on_error`.

use fleet_protocol::{ErrorInfo, StorePath};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Store Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by a store read or subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store read timed out after {0:?}")]
    Timeout(Duration),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store failure: {0}")]
    Permanent(String),

    #[error("store connection closed")]
    Closed,
}

impl StoreError {
    /// Default retry predicate for one-shot reads.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync Errors (delivered to consumers)
// ═══════════════════════════════════════════════════════════════════════════════

/// Error value delivered to a binding's `on_error` callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("initial read of {path} failed: {source}")]
    Read {
        path: StorePath,
        #[source]
        source: StoreError,
        retryable: bool,
    },

    #[error("subscription to {path} failed: {source}")]
    Subscription {
        path: StorePath,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    pub fn path(&self) -> &StorePath {
        match self {
            SyncError::Read { path, .. } | SyncError::Subscription { path, .. } => path,
        }
    }

    pub fn cause(&self) -> &StoreError {
        match self {
            SyncError::Read { source, .. } | SyncError::Subscription { source, .. } => source,
        }
    }

    /// Whether a manual refresh by the consumer can be expected to help.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Read { retryable, .. } => *retryable,
            SyncError::Subscription { source, .. } => {
                !matches!(source, StoreError::PermissionDenied(_))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Directory Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("device directory unavailable: {0}")]
    Unavailable(String),

    #[error("device directory rejected request: {0}")]
    Rejected(ErrorInfo),
}

// ═══════════════════════════════════════════════════════════════════════════════
// General Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors from configuration loading and other non-binding plumbing.
#[derive(Debug, thiserror::Error)]
pub enum FleetSyncError {
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid store path: {0}")]
    InvalidPath(ErrorInfo),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Convenience type alias for Results using FleetSyncError.
pub type Result<T> = std::result::Result<T, FleetSyncError>;

impl From<ErrorInfo> for FleetSyncError {
    fn from(err: ErrorInfo) -> Self {
        FleetSyncError::InvalidPath(err)
    }
}
