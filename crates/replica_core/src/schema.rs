//! Persisted schema: one table per entity.
//!
//! | Table | Row | Unique keys |
//! |-------|-----|-------------|
//! | `declared_objects` | [`DeclaredObjectRow`] | object type |
//! | `declared_files` | [`DeclaredFileRow`] | (declared object, label) |
//! | `directory_objects` | [`ObjectEntry`] | file group |
//! | `directory_files` | [`FileEntry`] | file |
//! | `upload_objects` | [`UploadObjectTracker`] | batch; file group while started |
//! | `upload_files` | [`UploadFileTracker`] | |
//! | `download_objects` | [`DownloadObjectTracker`] | file group |
//! | `download_files` | [`DownloadFileTracker`] | file |
//! | `deletions` | [`DeletionTracker`] | target uuid |
//! | `network_cache` | [`NetworkCacheEntry`] | task identifier |
//!
//! Child rows hold their parent's [`RowId`]. Fields added after the first
//! release carry `#[serde(default)]` so older rows still decode.

use crate::network_cache::Transfer;
use crate::types::{
    BatchUuid, CloudStorageType, FileGroupUuid, FileUuid, FileVersion, GoneReason, MimeType,
    SharingGroupUuid, Timestamp,
};
use replica_store::{AnyTable, HasTable, Record, RowId, Schema, Table, Txn, UniqueKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// A write transaction over the replica tables.
pub type Tx<'a> = Txn<'a, ReplicaTables>;

/// A registered object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredObjectRow {
    /// Object type name.
    pub object_type: String,
}

impl Record for DeclaredObjectRow {
    const TABLE: &'static str = "declared_objects";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("object_type", &self.object_type)]
    }
}

/// A file label declared under an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredFileRow {
    /// Owning [`DeclaredObjectRow`].
    pub object_id: RowId,
    /// Label, unique within the object type.
    pub file_label: String,
    /// Allowed MIME types, sorted and de-duplicated.
    pub mime_types: Vec<MimeType>,
    /// Content change resolver used for later versions.
    pub change_resolver_name: Option<String>,
    /// Default app metadata for new files.
    pub app_meta_data: Option<String>,
}

impl Record for DeclaredFileRow {
    const TABLE: &'static str = "declared_files";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new(
            "object_label",
            format!("{}/{}", self.object_id.as_u64(), self.file_label),
        )]
    }
}

/// Directory entry for one file group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Object type.
    pub object_type: String,
    /// Sharing group.
    pub sharing_group_uuid: SharingGroupUuid,
    /// Storage provider.
    pub cloud_storage_type: CloudStorageType,
    /// Removed on this device.
    pub deleted_locally: bool,
    /// Removed on the server.
    pub deleted_on_server: bool,
}

impl Record for ObjectEntry {
    const TABLE: &'static str = "directory_objects";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("file_group", self.file_group_uuid)]
    }
}

/// Directory entry for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File.
    pub file_uuid: FileUuid,
    /// Owning file group.
    pub file_group_uuid: FileGroupUuid,
    /// Declared label.
    pub file_label: String,
    /// MIME type.
    pub mime_type: MimeType,
    /// Version held on this device.
    pub file_version: Option<FileVersion>,
    /// Latest version the server reported.
    pub server_file_version: Option<FileVersion>,
    /// Removed on this device.
    pub deleted_locally: bool,
    /// Removed on the server.
    pub deleted_on_server: bool,
    /// Set once the server reports the file gone.
    pub gone_reason: Option<GoneReason>,
    /// App metadata from the latest upload or index.
    pub app_meta_data: Option<String>,
    /// Creation date reported by the server.
    pub creation_date: Option<Timestamp>,
}

impl Record for FileEntry {
    const TABLE: &'static str = "directory_files";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("file", self.file_uuid)]
    }
}

/// Whether a batch uploads first versions or updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionClass {
    /// Every file is new to the server.
    V0,
    /// Every file already has a version.
    VN,
}

/// One queued upload batch for a file group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadObjectTracker {
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Batch sent to the server.
    pub batch_uuid: BatchUuid,
    /// Server-side batch expiry, in milliseconds.
    pub batch_expiry_interval_ms: u64,
    /// Classification decided at queue time.
    pub version_class: VersionClass,
    /// Unset until the batch is handed to the transport.
    pub v0_upload: Option<bool>,
    /// Server id of the deferred completion of a later-version batch.
    pub deferred_upload_id: Option<u64>,
    /// Message the server pushes to other clients.
    pub push_notification_message: Option<String>,
    /// Object type.
    pub object_type: String,
    /// Sharing group.
    pub sharing_group_uuid: SharingGroupUuid,
    /// Storage provider.
    pub cloud_storage_type: CloudStorageType,
    /// Set when the transport first picks up a file of this batch.
    pub started: bool,
    /// Queue time, for FIFO order.
    pub queued_at: Timestamp,
}

impl Record for UploadObjectTracker {
    const TABLE: &'static str = "upload_objects";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        let mut keys = vec![UniqueKey::new("batch", self.batch_uuid)];
        if self.started {
            keys.push(UniqueKey::new("active_upload", self.file_group_uuid));
        }
        keys
    }
}

/// Upload progress of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    /// Waiting for the transport.
    NotStarted,
    /// Handed to the transport.
    Uploading,
    /// Terminal.
    Uploaded,
}

/// Where an upload's content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoredSource {
    /// A copy in the staging directory, owned and removed by the replica.
    Staged(PathBuf),
    /// A caller file promised not to change.
    Reference(PathBuf),
    /// A staged copy removed when its attempt expired. The next start
    /// writes it again from the tracker's origin.
    Released(PathBuf),
}

impl StoredSource {
    /// Path of the content.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Staged(path) | Self::Reference(path) | Self::Released(path) => path,
        }
    }
}

/// What a staged copy was made from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StagingOrigin {
    /// Copied from a caller file.
    Copy(PathBuf),
    /// Written from in-memory content.
    Data(Vec<u8>),
}

/// One file of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileTracker {
    /// Owning [`UploadObjectTracker`].
    pub object_id: RowId,
    /// File.
    pub file_uuid: FileUuid,
    /// Declared label.
    pub file_label: String,
    /// MIME type.
    pub mime_type: MimeType,
    /// Progress.
    pub status: UploadStatus,
    /// Expiry resets so far.
    pub number_retries: u32,
    /// Version assigned once the upload succeeds.
    pub file_version: Option<FileVersion>,
    /// Content to upload.
    pub source: StoredSource,
    /// Origin of a staged copy, kept so an expired attempt can stage again.
    #[serde(default)]
    pub origin: Option<StagingOrigin>,
    /// Checksum of the content.
    pub check_sum: String,
    /// App metadata sent with the upload.
    pub app_meta_data: Option<String>,
    /// Resolver applied by the server for later versions.
    pub change_resolver_name: Option<String>,
    /// 1-based position within the batch.
    #[serde(default)]
    pub upload_index: u32,
    /// Number of files in the batch.
    #[serde(default)]
    pub upload_count: u32,
    /// Deadline of the current attempt.
    pub expiry: Option<Timestamp>,
    /// Ledger entry of the current attempt.
    pub network_cache_id: Option<RowId>,
}

impl Record for UploadFileTracker {
    const TABLE: &'static str = "upload_files";
}

/// Queued downloads for a file group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadObjectTracker {
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Queue time.
    pub queued_at: Timestamp,
}

impl Record for DownloadObjectTracker {
    const TABLE: &'static str = "download_objects";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("file_group", self.file_group_uuid)]
    }
}

/// Download progress of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadStatus {
    /// Waiting for the transport.
    NotStarted,
    /// Handed to the transport.
    Downloading,
    /// Terminal; waiting for the app to take the file.
    Downloaded,
}

/// One file of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileTracker {
    /// Owning [`DownloadObjectTracker`].
    pub object_id: RowId,
    /// File.
    pub file_uuid: FileUuid,
    /// Progress.
    pub status: DownloadStatus,
    /// Expiry resets so far.
    pub number_retries: u32,
    /// Version being downloaded.
    pub file_version: FileVersion,
    /// Where the content landed.
    pub local_url: Option<PathBuf>,
    /// Checksum reported with the content.
    pub check_sum: Option<String>,
    /// App metadata.
    pub app_meta_data: Option<String>,
    /// Set when the server reported the file gone.
    pub gone_reason: Option<GoneReason>,
    /// Deadline of the current attempt.
    pub expiry: Option<Timestamp>,
    /// Ledger entry of the current attempt.
    pub network_cache_id: Option<RowId>,
}

impl Record for DownloadFileTracker {
    const TABLE: &'static str = "download_files";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("file", self.file_uuid)]
    }
}

/// What a deletion tracker's uuid names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletionType {
    /// A whole file group.
    FileGroupUuid,
    /// A single file.
    FileUuid,
}

/// Deletion progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletionStatus {
    /// Waiting for the transport.
    NotStarted,
    /// Request in flight.
    Deleting,
    /// Server accepted; its asynchronous completion is pending.
    WaitingForDeferredDeletion,
    /// Terminal. A tracker reaching it is removed in the same transaction.
    Done,
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "notStarted",
            Self::Deleting => "deleting",
            Self::WaitingForDeferredDeletion => "waitingForDeferredDeletion",
            Self::Done => "done",
        })
    }
}

/// A pending deletion of a file group or file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionTracker {
    /// File group or file uuid.
    pub uuid: Uuid,
    /// What `uuid` names.
    pub deletion_type: DeletionType,
    /// Progress.
    pub status: DeletionStatus,
    /// Server id of the deferred completion.
    pub deferred_upload_id: Option<u64>,
    /// Deadline of the current request.
    pub expiry: Option<Timestamp>,
    /// Expiry resets so far.
    pub number_retries: u32,
}

impl Record for DeletionTracker {
    const TABLE: &'static str = "deletions";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("uuid", self.uuid)]
    }
}

/// A background transfer handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCacheEntry {
    /// OS task identifier.
    pub task_identifier: String,
    /// File being transferred.
    pub file_uuid: FileUuid,
    /// Version being transferred.
    pub file_version: Option<FileVersion>,
    /// Direction and, once known, the outcome.
    pub transfer: Transfer,
}

impl Record for NetworkCacheEntry {
    const TABLE: &'static str = "network_cache";

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::new("task", &self.task_identifier)]
    }
}

macro_rules! replica_tables {
    ($($field:ident: $row:ty),+ $(,)?) => {
        /// Every replica table.
        #[derive(Debug, Default)]
        pub struct ReplicaTables {
            $(
                #[doc = concat!("Rows of [`", stringify!($row), "`].")]
                pub $field: Table<$row>,
            )+
        }

        impl Schema for ReplicaTables {
            fn tables(&self) -> Vec<&dyn AnyTable> {
                vec![$(&self.$field),+]
            }

            fn tables_mut(&mut self) -> Vec<&mut dyn AnyTable> {
                vec![$(&mut self.$field),+]
            }
        }

        $(
            impl HasTable<$row> for ReplicaTables {
                fn table(&self) -> &Table<$row> {
                    &self.$field
                }

                fn table_mut(&mut self) -> &mut Table<$row> {
                    &mut self.$field
                }
            }
        )+
    };
}

replica_tables! {
    declared_objects: DeclaredObjectRow,
    declared_files: DeclaredFileRow,
    directory_objects: ObjectEntry,
    directory_files: FileEntry,
    upload_objects: UploadObjectTracker,
    upload_files: UploadFileTracker,
    download_objects: DownloadObjectTracker,
    download_files: DownloadFileTracker,
    deletions: DeletionTracker,
    network_cache: NetworkCacheEntry,
}

impl ReplicaTables {
    /// Directory entry of a file group.
    #[must_use]
    pub fn object_entry(&self, group: FileGroupUuid) -> Option<(RowId, &ObjectEntry)> {
        self.directory_objects.by_key("file_group", group)
    }

    /// Directory entry of a file.
    #[must_use]
    pub fn file_entry(&self, file: FileUuid) -> Option<(RowId, &FileEntry)> {
        self.directory_files.by_key("file", file)
    }

    /// Pending deletion of a file group or file.
    #[must_use]
    pub fn deletion(&self, uuid: Uuid) -> Option<(RowId, &DeletionTracker)> {
        self.deletions.by_key("uuid", uuid)
    }

    /// Ledger entry of a task.
    #[must_use]
    pub fn network_cache_entry(&self, task_identifier: &str) -> Option<(RowId, &NetworkCacheEntry)> {
        self.network_cache.by_key("task", task_identifier)
    }

    /// Download tracker of a file group.
    #[must_use]
    pub fn download_object(&self, group: FileGroupUuid) -> Option<(RowId, &DownloadObjectTracker)> {
        self.download_objects.by_key("file_group", group)
    }

    /// Download tracker of a file.
    #[must_use]
    pub fn download_file(&self, file: FileUuid) -> Option<(RowId, &DownloadFileTracker)> {
        self.download_files.by_key("file", file)
    }

    /// Upload batches of a file group, oldest first.
    pub fn upload_batches(
        &self,
        group: FileGroupUuid,
    ) -> impl Iterator<Item = (RowId, &UploadObjectTracker)> + '_ {
        self.upload_objects
            .filter(move |t| t.file_group_uuid == group)
    }

    /// File trackers of an upload batch.
    pub fn upload_files_of(&self, object_id: RowId) -> impl Iterator<Item = (RowId, &UploadFileTracker)> + '_ {
        self.upload_files.filter(move |f| f.object_id == object_id)
    }

    /// File trackers of a download.
    pub fn download_files_of(
        &self,
        object_id: RowId,
    ) -> impl Iterator<Item = (RowId, &DownloadFileTracker)> + '_ {
        self.download_files.filter(move |f| f.object_id == object_id)
    }

    /// Files of a file group in the directory.
    pub fn files_in_group(&self, group: FileGroupUuid) -> impl Iterator<Item = (RowId, &FileEntry)> + '_ {
        self.directory_files
            .filter(move |f| f.file_group_uuid == group)
    }
}
