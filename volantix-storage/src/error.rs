//! Error types for the storage engine.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// HTTP-style status error (conflict, not found, unavailable).
    #[error("{message}")]
    Status { code: u16, message: String },

    /// A quota change would shrink the volume below its current size.
    #[error("Volume cannot be shrunk: {0}")]
    CannotBeShrunk(String),

    /// The driver does not implement the requested operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Restore is blocked by snapshots newer than the restore target.
    /// Carries the names of the blocking snapshots so the caller can prune
    /// them and retry.
    #[error("Snapshots that must be deleted first: {}", names.join(", "))]
    DeleteSnapshots { names: Vec<String> },

    /// Snapshot sets in the backup descriptor and on the storage device
    /// do not match.
    #[error("Backup snapshot mismatch: {0}")]
    BackupSnapshotMismatch(String),

    /// Invalid volume or pool configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A precondition check failed before any side effect was made.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Migration negotiation, header exchange, or transfer failure.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Record store failure.
    #[error("Record store error: {0}")]
    Store(String),

    /// Driver-level failure.
    #[error("Driver error: {0}")]
    Driver(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Conflict (409): the entity already exists or is in use.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Status {
            code: 409,
            message: message.into(),
        }
    }

    /// Not found (404).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Status {
            code: 404,
            message: message.into(),
        }
    }

    /// Unavailable (503): the pool cannot serve requests right now.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Status {
            code: 503,
            message: message.into(),
        }
    }

    /// The HTTP-style status code, if this is a status error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when this error represents a missing entity.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// True when this error represents a conflicting entity.
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
