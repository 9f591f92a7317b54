//! Error types for the replica.
//!
//! Errors fall into three groups:
//! - **Validation**: bad input shape, detected before anything is written
//! - **Integrity**: the request contradicts durable state, usually a logic
//!   bug or a race between clients; never patched over silently
//! - **Storage**: the durable store or the staging area failed
//!
//! Transport failures are not errors here: an interrupted transfer shows up
//! as a tracker that expires and is retried.

use crate::types::{FileGroupUuid, FileUuid, SharingGroupUuid};
use replica_store::StoreError;
use std::io;
use thiserror::Error;

/// Result type for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors that can occur in replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Two files in one declaration share a label.
    #[error("object type {object_type} declares file label {file_label} more than once")]
    DuplicateFileLabel {
        /// Object type being registered.
        object_type: String,
        /// Repeated label.
        file_label: String,
    },

    /// A re-registration changes an existing label's MIME types or resolver.
    #[error("file label {file_label} of {object_type} is already declared differently")]
    MatchingFileLabelButOtherDifferences {
        /// Object type being registered.
        object_type: String,
        /// Conflicting label.
        file_label: String,
    },

    /// A declaration without files.
    #[error("object type {0} declares no files")]
    NoDeclaredFiles(String),

    /// The object type was never registered.
    #[error("unknown object type: {0}")]
    UnknownObjectType(String),

    /// The file label is not declared under the object type.
    #[error("file label {file_label} is not declared for object type {object_type}")]
    UnknownFileLabel {
        /// Object type.
        object_type: String,
        /// Undeclared label.
        file_label: String,
    },

    /// The MIME type is not among the label's declared types.
    #[error("MIME type {mime_type} is not declared for file label {file_label}")]
    MimeTypeNotDeclared {
        /// File label.
        file_label: String,
        /// Offending MIME type.
        mime_type: String,
    },

    /// The label declares several MIME types and the request names none.
    #[error("file label {0} declares several MIME types; one must be given")]
    MimeTypeRequired(String),

    /// An upload names the same file twice.
    #[error("upload request repeats a file UUID")]
    UploadsDoNotHaveDistinctUUIDs,

    /// A download names the same file twice.
    #[error("download request repeats a file UUID")]
    DownloadsDoNotHaveDistinctUUIDs,

    /// A request without files.
    #[error("request contains no files")]
    EmptyRequest,

    /// The target is deleted or has a deletion pending.
    #[error("cannot queue {0}: it is deleted")]
    AttemptToQueueADeletedFile(String),

    /// An upload batch mixes first uploads with updates.
    #[error("upload for file group {0} mixes first-version and later-version files")]
    SomeUploadFilesV0SomeVN(FileGroupUuid),

    /// A later-version upload for a label without a change resolver.
    #[error("file label {file_label} of {object_type} has no change resolver for updates")]
    NoChangeResolver {
        /// Object type.
        object_type: String,
        /// Label lacking a resolver.
        file_label: String,
    },

    /// An index entry whose object type cannot be determined.
    #[error("cannot determine object type of file {0}")]
    MissingObjectType(FileUuid),

    /// An index entry whose file label cannot be determined.
    #[error("cannot determine file label of file {0}")]
    MissingFileLabel(FileUuid),

    /// An index names the same file twice.
    #[error("file index repeats file {0}")]
    DuplicateFileUUIDInIndex(FileUuid),

    /// An index entry outside the sharing group being reconciled.
    #[error("file {file_uuid} belongs to sharing group {actual}, expected {expected}")]
    SharingGroupMismatch {
        /// File in question.
        file_uuid: FileUuid,
        /// Sharing group of the call.
        expected: SharingGroupUuid,
        /// Sharing group of the entry.
        actual: SharingGroupUuid,
    },

    /// The target is already deleted both locally and on the server.
    #[error("{0} is already deleted")]
    AlreadyDeleted(String),

    /// No directory entry exists for the target.
    #[error("no directory entry for {0}")]
    NoObject(String),

    /// An immutable field differs from the stored value.
    #[error("{field} of {key} does not match: stored {existing}, incoming {incoming}")]
    NotMatching {
        /// Field name.
        field: &'static str,
        /// Key of the row.
        key: String,
        /// Stored value.
        existing: String,
        /// Incoming value.
        incoming: String,
    },

    /// No tracker matches the request.
    #[error("no tracker for {0}")]
    UnknownTracker(String),

    /// No ledger entry has the task identifier.
    #[error("unknown transfer task: {0}")]
    UnknownTransfer(String),

    /// A state change not allowed from the current status.
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        /// What is changing state.
        entity: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Durable store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error while staging content.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Content must be staged but the replica has no staging directory.
    #[error("no staging directory configured")]
    StagingUnavailable,
}

impl ReplicaError {
    /// Creates a mismatch error for an immutable field.
    pub fn not_matching(
        field: &'static str,
        key: impl ToString,
        existing: impl ToString,
        incoming: impl ToString,
    ) -> Self {
        Self::NotMatching {
            field,
            key: key.to_string(),
            existing: existing.to_string(),
            incoming: incoming.to_string(),
        }
    }

    /// Creates a transition error.
    pub fn invalid_transition(
        entity: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns true for bad input rejected before any write.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateFileLabel { .. }
                | Self::MatchingFileLabelButOtherDifferences { .. }
                | Self::NoDeclaredFiles(_)
                | Self::UnknownObjectType(_)
                | Self::UnknownFileLabel { .. }
                | Self::MimeTypeNotDeclared { .. }
                | Self::MimeTypeRequired(_)
                | Self::UploadsDoNotHaveDistinctUUIDs
                | Self::DownloadsDoNotHaveDistinctUUIDs
                | Self::EmptyRequest
                | Self::AttemptToQueueADeletedFile(_)
                | Self::SomeUploadFilesV0SomeVN(_)
                | Self::NoChangeResolver { .. }
                | Self::MissingObjectType(_)
                | Self::MissingFileLabel(_)
                | Self::DuplicateFileUUIDInIndex(_)
                | Self::SharingGroupMismatch { .. }
                | Self::AlreadyDeleted(_)
        )
    }

    /// Returns true for requests that contradict durable state.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::NoObject(_)
                | Self::NotMatching { .. }
                | Self::UnknownTracker(_)
                | Self::UnknownTransfer(_)
                | Self::InvalidTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ReplicaError::EmptyRequest.is_validation());
        assert!(!ReplicaError::EmptyRequest.is_integrity());
        assert!(ReplicaError::SomeUploadFilesV0SomeVN(FileGroupUuid::random()).is_validation());

        let mismatch = ReplicaError::not_matching("objectType", "g", "Foo", "Bar");
        assert!(mismatch.is_integrity());
        assert!(!mismatch.is_validation());

        let store = ReplicaError::from(StoreError::Locked);
        assert!(!store.is_validation());
        assert!(!store.is_integrity());
    }

    #[test]
    fn error_display() {
        let err = ReplicaError::not_matching("mimeType", "file-1", "text/plain", "image/png");
        let text = err.to_string();
        assert!(text.contains("mimeType"));
        assert!(text.contains("image/png"));

        let err = ReplicaError::invalid_transition("upload file-1", "uploaded", "uploading");
        assert_eq!(err.to_string(), "upload file-1 cannot move from uploaded to uploading");
    }
}
