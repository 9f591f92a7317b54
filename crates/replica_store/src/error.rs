//! Error types for the table store.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the table store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A row or journal payload could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// The journal or snapshot is corrupted.
    #[error("store corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A journal frame failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the damaged frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A write would break a uniqueness constraint.
    #[error("unique constraint {constraint} violated in {table} by key {key}")]
    UniqueViolation {
        /// Table holding the constraint.
        table: &'static str,
        /// Constraint name.
        constraint: &'static str,
        /// Offending key value.
        key: String,
    },

    /// A row addressed by id does not exist.
    #[error("row {id} not found in {table}")]
    RowNotFound {
        /// Table that was searched.
        table: &'static str,
        /// The missing row id.
        id: u64,
    },

    /// A journal record names a table the schema does not know.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// Running a migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a migration failure.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Returns true if the on-disk state is damaged and must not be reopened
    /// without operator intervention.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::ChecksumMismatch { .. })
    }
}
