//! Directory store: the durable replica of what exists.
//!
//! One [`ObjectEntry`] per file group and one [`FileEntry`] per file. Entries
//! are never removed; deletion is recorded in two independent flags:
//! `deleted_on_server`, owned by the server index, and `deleted_locally`,
//! owned by this client.

use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::{FileEntry, ObjectEntry, ReplicaTables, Tx};
use crate::types::{
    CloudStorageType, FileGroupUuid, FileUuid, FileVersion, GoneReason, MimeType, SharingGroupUuid,
    Timestamp,
};
use replica_store::RowId;
use serde::{Deserialize, Serialize};

/// What a file needs, derived from its local and server versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileState {
    /// Not yet on the server.
    NeedsUpload,
    /// The server holds a newer version.
    NeedsDownload,
    /// Up to date.
    NoChange,
}

/// Derives a file's state from `(local, server)` versions.
#[must_use]
pub fn file_state(local: Option<FileVersion>, server: Option<FileVersion>) -> FileState {
    match (local, server) {
        (None, None) => FileState::NeedsUpload,
        (None, Some(_)) => FileState::NeedsDownload,
        (Some(_), None) => FileState::NoChange,
        (Some(local), Some(server)) if local < server => FileState::NeedsDownload,
        (Some(_), Some(_)) => FileState::NoChange,
    }
}

impl FileEntry {
    /// Derived state of this file.
    #[must_use]
    pub fn state(&self) -> FileState {
        file_state(self.file_version, self.server_file_version)
    }
}

/// One row of the server's file index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFileInfo {
    /// File.
    pub file_uuid: FileUuid,
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Sharing group.
    pub sharing_group_uuid: SharingGroupUuid,
    /// MIME type.
    pub mime_type: MimeType,
    /// Deleted on the server.
    pub deleted: bool,
    /// Server version.
    pub file_version: FileVersion,
    /// Storage provider.
    pub cloud_storage_type: CloudStorageType,
    /// Object type, when the server knows it.
    pub object_type: Option<String>,
    /// File label, when the server knows it.
    pub file_label: Option<String>,
    /// App metadata.
    pub app_meta_data: Option<String>,
    /// Creation date.
    pub creation_date: Timestamp,
}

/// What a match-sert wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSert {
    /// A new object entry was created.
    pub object_created: bool,
    /// An existing object entry changed.
    pub object_updated: bool,
    /// A new file entry was created.
    pub file_created: bool,
    /// An existing file entry changed.
    pub file_updated: bool,
}

/// Merges one server index row into the directory.
///
/// # Errors
///
/// Fails with [`ReplicaError::NotMatching`] if an immutable field differs
/// from the stored entry.
pub fn match_sert(
    txn: &mut Tx<'_>,
    info: &ServerFileInfo,
    object_type: &str,
    file_label: &str,
) -> ReplicaResult<MatchSert> {
    match_sert_with(txn, info, object_type, file_label, info.deleted)
}

/// As [`match_sert`], with the object's server deletion flag supplied by the
/// caller, who may know more rows of the same file group.
pub(crate) fn match_sert_with(
    txn: &mut Tx<'_>,
    info: &ServerFileInfo,
    object_type: &str,
    file_label: &str,
    object_deleted: bool,
) -> ReplicaResult<MatchSert> {
    let mut result = MatchSert::default();

    match txn.tables().object_entry(info.file_group_uuid) {
        Some((id, entry)) => {
            check_object(entry, object_type, info.sharing_group_uuid, info.cloud_storage_type)?;
            result.object_updated =
                txn.modify::<ObjectEntry, _>(id, |e| e.deleted_on_server = object_deleted)?;
        }
        None => {
            txn.insert(ObjectEntry {
                file_group_uuid: info.file_group_uuid,
                object_type: object_type.to_string(),
                sharing_group_uuid: info.sharing_group_uuid,
                cloud_storage_type: info.cloud_storage_type,
                deleted_locally: object_deleted,
                deleted_on_server: object_deleted,
            })?;
            result.object_created = true;
        }
    }

    match txn.tables().file_entry(info.file_uuid) {
        Some((id, entry)) => {
            check_file(entry, info.file_group_uuid, file_label, &info.mime_type)?;
            result.file_updated = txn.modify::<FileEntry, _>(id, |e| {
                e.server_file_version = Some(info.file_version);
                e.deleted_on_server = info.deleted;
                if info.app_meta_data.is_some() {
                    e.app_meta_data.clone_from(&info.app_meta_data);
                }
                if e.creation_date.is_none() {
                    e.creation_date = Some(info.creation_date);
                }
            })?;
        }
        None => {
            txn.insert(FileEntry {
                file_uuid: info.file_uuid,
                file_group_uuid: info.file_group_uuid,
                file_label: file_label.to_string(),
                mime_type: info.mime_type.normalized(),
                file_version: None,
                server_file_version: Some(info.file_version),
                deleted_locally: info.deleted,
                deleted_on_server: info.deleted,
                gone_reason: None,
                app_meta_data: info.app_meta_data.clone(),
                creation_date: Some(info.creation_date),
            })?;
            result.file_created = true;
        }
    }

    if result != MatchSert::default() {
        tracing::debug!(
            file = %info.file_uuid,
            group = %info.file_group_uuid,
            ?result,
            "directory entry merged from index"
        );
    }
    Ok(result)
}

pub(crate) fn check_object(
    entry: &ObjectEntry,
    object_type: &str,
    sharing_group: SharingGroupUuid,
    cloud_storage_type: CloudStorageType,
) -> ReplicaResult<()> {
    let key = entry.file_group_uuid;
    if entry.object_type != object_type {
        return Err(ReplicaError::not_matching("objectType", key, &entry.object_type, object_type));
    }
    if entry.sharing_group_uuid != sharing_group {
        return Err(ReplicaError::not_matching(
            "sharingGroupUUID",
            key,
            entry.sharing_group_uuid,
            sharing_group,
        ));
    }
    if entry.cloud_storage_type != cloud_storage_type {
        return Err(ReplicaError::not_matching(
            "cloudStorageType",
            key,
            entry.cloud_storage_type,
            cloud_storage_type,
        ));
    }
    Ok(())
}

pub(crate) fn check_file(
    entry: &FileEntry,
    group: FileGroupUuid,
    file_label: &str,
    mime_type: &MimeType,
) -> ReplicaResult<()> {
    let key = entry.file_uuid;
    if entry.file_group_uuid != group {
        return Err(ReplicaError::not_matching("fileGroupUUID", key, entry.file_group_uuid, group));
    }
    if entry.file_label != file_label {
        return Err(ReplicaError::not_matching("fileLabel", key, &entry.file_label, file_label));
    }
    if entry.mime_type != mime_type.normalized() {
        return Err(ReplicaError::not_matching("mimeType", key, &entry.mime_type, mime_type));
    }
    Ok(())
}

/// Object-level fields of a local upload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalObject<'a> {
    pub file_group_uuid: FileGroupUuid,
    pub object_type: &'a str,
    pub sharing_group_uuid: SharingGroupUuid,
    pub cloud_storage_type: CloudStorageType,
}

/// File-level fields of a local upload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalFile<'a> {
    pub file_uuid: FileUuid,
    pub file_label: &'a str,
    pub mime_type: &'a MimeType,
    pub app_meta_data: Option<&'a str>,
}

/// Records a locally queued upload in the directory.
///
/// New entries start without a version, so they read as needing upload until
/// the upload completes.
pub(crate) fn upsert_for_upload(
    txn: &mut Tx<'_>,
    object: LocalObject<'_>,
    files: &[LocalFile<'_>],
) -> ReplicaResult<()> {
    match txn.tables().object_entry(object.file_group_uuid) {
        Some((_, entry)) => check_object(
            entry,
            object.object_type,
            object.sharing_group_uuid,
            object.cloud_storage_type,
        )?,
        None => {
            txn.insert(ObjectEntry {
                file_group_uuid: object.file_group_uuid,
                object_type: object.object_type.to_string(),
                sharing_group_uuid: object.sharing_group_uuid,
                cloud_storage_type: object.cloud_storage_type,
                deleted_locally: false,
                deleted_on_server: false,
            })?;
        }
    }

    for file in files {
        match txn.tables().file_entry(file.file_uuid) {
            Some((id, entry)) => {
                check_file(entry, object.file_group_uuid, file.file_label, file.mime_type)?;
                if let Some(app_meta_data) = file.app_meta_data {
                    txn.modify::<FileEntry, _>(id, |e| e.app_meta_data = Some(app_meta_data.to_string()))?;
                }
            }
            None => {
                txn.insert(FileEntry {
                    file_uuid: file.file_uuid,
                    file_group_uuid: object.file_group_uuid,
                    file_label: file.file_label.to_string(),
                    mime_type: file.mime_type.clone(),
                    file_version: None,
                    server_file_version: None,
                    deleted_locally: false,
                    deleted_on_server: false,
                    gone_reason: None,
                    app_meta_data: file.app_meta_data.map(String::from),
                    creation_date: None,
                })?;
            }
        }
    }
    Ok(())
}

/// Sets a file's local version.
pub(crate) fn set_file_version(txn: &mut Tx<'_>, file: FileUuid, version: FileVersion) -> ReplicaResult<()> {
    let (id, _) = txn
        .tables()
        .file_entry(file)
        .ok_or_else(|| ReplicaError::NoObject(format!("file {file}")))?;
    txn.modify::<FileEntry, _>(id, |e| e.file_version = Some(version))?;
    Ok(())
}

/// Records that the server reports a file gone.
pub(crate) fn set_gone(txn: &mut Tx<'_>, file: FileUuid, reason: GoneReason) -> ReplicaResult<()> {
    let (id, _) = txn
        .tables()
        .file_entry(file)
        .ok_or_else(|| ReplicaError::NoObject(format!("file {file}")))?;
    txn.modify::<FileEntry, _>(id, |e| e.gone_reason = Some(reason))?;
    Ok(())
}

/// Sets both deletion flags on a file group and all of its files.
pub(crate) fn mark_object_deleted(txn: &mut Tx<'_>, group: FileGroupUuid) -> ReplicaResult<()> {
    let (id, _) = txn
        .tables()
        .object_entry(group)
        .ok_or_else(|| ReplicaError::NoObject(format!("file group {group}")))?;
    txn.modify::<ObjectEntry, _>(id, |e| {
        e.deleted_locally = true;
        e.deleted_on_server = true;
    })?;
    let files: Vec<RowId> = txn.tables().files_in_group(group).map(|(id, _)| id).collect();
    for id in files {
        txn.modify::<FileEntry, _>(id, |e| {
            e.deleted_locally = true;
            e.deleted_on_server = true;
        })?;
    }
    Ok(())
}

/// Sets both deletion flags on one file.
pub(crate) fn mark_file_deleted(txn: &mut Tx<'_>, file: FileUuid) -> ReplicaResult<()> {
    let (id, _) = txn
        .tables()
        .file_entry(file)
        .ok_or_else(|| ReplicaError::NoObject(format!("file {file}")))?;
    txn.modify::<FileEntry, _>(id, |e| {
        e.deleted_locally = true;
        e.deleted_on_server = true;
    })?;
    Ok(())
}

/// A file the app should download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDownloadNeed {
    /// File.
    pub file_uuid: FileUuid,
    /// Declared label.
    pub file_label: String,
    /// MIME type.
    pub mime_type: MimeType,
    /// Version to download.
    pub file_version: Option<FileVersion>,
    /// Set when the server reports the file gone.
    pub gone_reason: Option<GoneReason>,
    /// App metadata.
    pub app_meta_data: Option<String>,
}

/// A file group with files to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectDownloadNeed {
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Object type.
    pub object_type: String,
    /// Sharing group.
    pub sharing_group_uuid: SharingGroupUuid,
    /// Files to download.
    pub files: Vec<FileDownloadNeed>,
}

fn download_need(
    tables: &ReplicaTables,
    object: &ObjectEntry,
    include_gone: bool,
) -> Option<ObjectDownloadNeed> {
    if object.deleted_on_server || object.deleted_locally {
        return None;
    }
    let files: Vec<FileDownloadNeed> = tables
        .files_in_group(object.file_group_uuid)
        .map(|(_, f)| f)
        .filter(|f| !f.deleted_on_server && !f.deleted_locally)
        .filter(|f| tables.download_file(f.file_uuid).is_none())
        .filter(|f| match f.gone_reason {
            Some(_) => include_gone,
            None => f.state() == FileState::NeedsDownload,
        })
        .map(|f| FileDownloadNeed {
            file_uuid: f.file_uuid,
            file_label: f.file_label.clone(),
            mime_type: f.mime_type.clone(),
            file_version: f.server_file_version,
            gone_reason: f.gone_reason,
            app_meta_data: f.app_meta_data.clone(),
        })
        .collect();
    if files.is_empty() {
        return None;
    }
    Some(ObjectDownloadNeed {
        file_group_uuid: object.file_group_uuid,
        object_type: object.object_type.clone(),
        sharing_group_uuid: object.sharing_group_uuid,
        files,
    })
}

/// File groups in a sharing group with files to download.
///
/// Excludes deleted entries and files already queued for download. Gone
/// files are reported only when `include_gone` is set.
#[must_use]
pub fn objects_needing_download(
    tables: &ReplicaTables,
    sharing_group: SharingGroupUuid,
    include_gone: bool,
) -> Vec<ObjectDownloadNeed> {
    tables
        .directory_objects
        .filter(move |o| o.sharing_group_uuid == sharing_group)
        .filter_map(|(_, o)| download_need(tables, o, include_gone))
        .collect()
}

/// Files of one file group to download, if any.
///
/// # Errors
///
/// Fails with [`ReplicaError::NoObject`] if the file group is unknown.
pub fn object_needs_download(
    tables: &ReplicaTables,
    group: FileGroupUuid,
    include_gone: bool,
) -> ReplicaResult<Option<ObjectDownloadNeed>> {
    let (_, object) = tables
        .object_entry(group)
        .ok_or_else(|| ReplicaError::NoObject(format!("file group {group}")))?;
    Ok(download_need(tables, object, include_gone))
}

/// File groups deleted on the server but still present on this device.
#[must_use]
pub fn objects_needing_local_deletion(tables: &ReplicaTables) -> Vec<ObjectEntry> {
    tables
        .directory_objects
        .filter(|o| o.deleted_on_server && !o.deleted_locally)
        .map(|(_, o)| o.clone())
        .collect()
}

/// Records that the app removed a server-deleted file group locally.
///
/// # Errors
///
/// Fails if the group is unknown or not deleted on the server; a live group
/// is removed through the deletion queue instead.
pub fn mark_as_deleted_locally(txn: &mut Tx<'_>, group: FileGroupUuid) -> ReplicaResult<bool> {
    let (id, entry) = txn
        .tables()
        .object_entry(group)
        .ok_or_else(|| ReplicaError::NoObject(format!("file group {group}")))?;
    if !entry.deleted_on_server {
        return Err(ReplicaError::invalid_transition(
            format!("file group {group}"),
            "live on server",
            "deleted locally",
        ));
    }
    let changed = txn.modify::<ObjectEntry, _>(id, |e| e.deleted_locally = true)?;
    let files: Vec<RowId> = txn.tables().files_in_group(group).map(|(id, _)| id).collect();
    for id in files {
        txn.modify::<FileEntry, _>(id, |e| e.deleted_locally = true)?;
    }
    if changed {
        tracing::info!(%group, "file group deleted locally");
    }
    Ok(changed)
}

/// Directory entry of a file group.
#[must_use]
pub fn object_entry(tables: &ReplicaTables, group: FileGroupUuid) -> Option<ObjectEntry> {
    tables.object_entry(group).map(|(_, e)| e.clone())
}

/// Directory entry of a file.
#[must_use]
pub fn file_entry(tables: &ReplicaTables, file: FileUuid) -> Option<FileEntry> {
    tables.file_entry(file).map(|(_, e)| e.clone())
}

/// Directory entries of a file group's files.
#[must_use]
pub fn file_entries(tables: &ReplicaTables, group: FileGroupUuid) -> Vec<FileEntry> {
    tables.files_in_group(group).map(|(_, e)| e.clone()).collect()
}
