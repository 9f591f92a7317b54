//! # Replica Core
//!
//! On-device sync replica and durable transfer queues.
//!
//! This crate provides:
//! - Declared object registry (object types, file labels, MIME types)
//! - Directory store: the local replica of server-known files
//! - Upload, download and deletion queues with crash-safe trackers
//! - Background transfer ledger for outcomes reported after a relaunch
//! - Index reconciler merging the server's file index
//!
//! ## Architecture
//!
//! Every operation is one transaction on a [`replica_store::Store`]. A
//! validation failure rolls the transaction back, so callers never observe
//! a partial queue or a half-applied index. Completion of a transfer is
//! recorded in the ledger first and consumed in a second transaction, which
//! lets a freshly started process replay it.
//!
//! ## Key Invariants
//!
//! - An upload batch is all first versions or all updates
//! - At most one upload batch per file group runs at a time
//! - One download tracker per file group and per file
//! - One deletion tracker per target
//! - `deleted_locally` and `deleted_on_server` are set independently
//! - Re-applying an identical index writes nothing
//!
//! ## Example
//!
//! ```rust
//! use replica_core::{
//!     CloudStorageType, DeclaredFile, DeclaredObject, FileGroupUuid, FileUuid, MimeType, Replica,
//!     ReplicaConfig, SharingGroupUuid, UploadFile, UploadSource, UploadableObject,
//! };
//!
//! let staging = tempfile::tempdir().unwrap();
//! let replica = Replica::open_in_memory_with_config(ReplicaConfig::new().staging_dir(staging.path())).unwrap();
//! replica
//!     .register(&DeclaredObject::new(
//!         "Note",
//!         vec![DeclaredFile::new("body", [MimeType::new("text/plain")])],
//!     ))
//!     .unwrap();
//!
//! let group = FileGroupUuid::random();
//! let file = FileUuid::random();
//! replica
//!     .queue_upload(&UploadableObject::new(
//!         group,
//!         "Note",
//!         SharingGroupUuid::random(),
//!         CloudStorageType::Dropbox,
//!         vec![UploadFile::new(file, "body", UploadSource::Data(b"hi".to_vec()))],
//!     ))
//!     .unwrap();
//! assert_eq!(replica.next_uploads(10).len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
pub mod declared;
pub mod deletion;
pub mod directory;
pub mod download;
mod error;
mod hasher;
pub mod migrations;
pub mod network_cache;
pub mod reconciler;
pub mod recovery;
mod replica;
pub mod schema;
mod types;
pub mod upload;
mod verify;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReplicaConfig;
pub use declared::{DeclaredFile, DeclaredObject, RegisterOutcome};
pub use deletion::{DeletionAccepted, DeletionQueued, DeletionTarget, PendingDeletion};
pub use directory::{file_state, FileDownloadNeed, FileState, ObjectDownloadNeed, ServerFileInfo};
pub use download::{CompletedDownload, DownloadFile, DownloadRequest, PendingDownload, QueuedDownload};
pub use error::{ReplicaError, ReplicaResult};
pub use hasher::{ContentHasher, Sha256Hasher};
pub use network_cache::{Direction, DownloadBody, Transfer, TransferOutcome, UploadBody};
pub use reconciler::{LabelResolver, NoLabelResolver, ReconcileReport};
pub use recovery::{DeferredIds, ExpiredReset, ReattachReport, SweepReport};
pub use replica::{Replica, TransferCompletion};
pub use schema::{
    DeletionStatus, DeletionType, DownloadStatus, FileEntry, NetworkCacheEntry, ObjectEntry, ReplicaTables,
    StagingOrigin, StoredSource, UploadStatus, VersionClass,
};
pub use types::{
    BatchUuid, CloudStorageType, FileGroupUuid, FileUuid, FileVersion, GoneReason, MimeType, SharingGroupUuid,
    Timestamp,
};
pub use upload::{PendingUpload, QueuedUpload, UploadFile, UploadSource, UploadableObject};
pub use verify::{VerifyReport, Violation};
