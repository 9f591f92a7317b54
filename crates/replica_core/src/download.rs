//! Download queue.
//!
//! One [`DownloadObjectTracker`] per file group and one
//! [`DownloadFileTracker`] per file, both enforced by unique keys, so queuing
//! the same group twice only adds files that are not tracked yet.
//!
//! A downloaded file stays tracked until the app takes it with
//! [`mark_file_downloaded`] or [`mark_object_downloaded`]. Neither touches
//! the directory unless the caller asks for the version to be recorded.

use crate::directory;
use crate::error::{ReplicaError, ReplicaResult};
use crate::network_cache::{self, Direction, DownloadBody};
use crate::recovery::ExpiredReset;
use crate::schema::{
    DownloadFileTracker, DownloadObjectTracker, DownloadStatus, NetworkCacheEntry, ReplicaTables, Tx,
};
use crate::types::{FileGroupUuid, FileUuid, FileVersion, GoneReason, MimeType, Timestamp};
use replica_store::RowId;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// One file of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadFile {
    /// File.
    pub file_uuid: FileUuid,
    /// Version to download.
    pub file_version: FileVersion,
}

/// A download request for one file group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Files to download.
    pub files: Vec<DownloadFile>,
}

impl DownloadRequest {
    /// Creates a download request.
    pub fn new(file_group_uuid: FileGroupUuid, files: Vec<DownloadFile>) -> Self {
        Self { file_group_uuid, files }
    }
}

/// Result of queuing a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedDownload {
    /// Object tracker row.
    pub tracker_id: RowId,
    /// The object tracker was created by this call.
    pub created: bool,
    /// File trackers added by this call.
    pub added: usize,
}

/// Queues files of one file group for download.
///
/// # Errors
///
/// Fails on an empty or repeating request, on files unknown to the
/// directory or outside the group, and on deleted groups or files.
pub fn queue(txn: &mut Tx<'_>, request: &DownloadRequest, now: Timestamp) -> ReplicaResult<QueuedDownload> {
    let group = request.file_group_uuid;
    if request.files.is_empty() {
        return Err(ReplicaError::EmptyRequest);
    }
    let mut seen = HashSet::new();
    if !request.files.iter().all(|f| seen.insert(f.file_uuid)) {
        return Err(ReplicaError::DownloadsDoNotHaveDistinctUUIDs);
    }

    let tables = txn.tables();
    let (_, object) = tables
        .object_entry(group)
        .ok_or_else(|| ReplicaError::NoObject(format!("file group {group}")))?;
    if object.deleted_locally || object.deleted_on_server {
        return Err(ReplicaError::AttemptToQueueADeletedFile(format!("file group {group}")));
    }
    let mut app_meta_data = Vec::with_capacity(request.files.len());
    for file in &request.files {
        let (_, entry) = tables
            .file_entry(file.file_uuid)
            .ok_or_else(|| ReplicaError::NoObject(format!("file {}", file.file_uuid)))?;
        if entry.file_group_uuid != group {
            return Err(ReplicaError::not_matching(
                "fileGroupUUID",
                file.file_uuid,
                entry.file_group_uuid,
                group,
            ));
        }
        if entry.deleted_locally || entry.deleted_on_server {
            return Err(ReplicaError::AttemptToQueueADeletedFile(format!("file {}", file.file_uuid)));
        }
        app_meta_data.push(entry.app_meta_data.clone());
    }

    let (tracker_id, created) = match txn.tables().download_object(group) {
        Some((id, _)) => (id, false),
        None => {
            let id = txn.insert(DownloadObjectTracker {
                file_group_uuid: group,
                queued_at: now,
            })?;
            (id, true)
        }
    };

    let mut added = 0;
    for (file, app_meta_data) in request.files.iter().zip(app_meta_data) {
        if txn.tables().download_file(file.file_uuid).is_some() {
            continue;
        }
        txn.insert(DownloadFileTracker {
            object_id: tracker_id,
            file_uuid: file.file_uuid,
            status: DownloadStatus::NotStarted,
            number_retries: 0,
            file_version: file.file_version,
            local_url: None,
            check_sum: None,
            app_meta_data,
            gone_reason: None,
            expiry: None,
            network_cache_id: None,
        })?;
        added += 1;
    }

    if created || added > 0 {
        tracing::info!(%group, added, created, "download queued");
    } else {
        tracing::debug!(%group, "download already queued");
    }
    Ok(QueuedDownload {
        tracker_id,
        created,
        added,
    })
}

/// A file ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDownload {
    /// File.
    pub file_uuid: FileUuid,
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Version to download.
    pub file_version: FileVersion,
    /// Declared label.
    pub file_label: String,
    /// MIME type.
    pub mime_type: MimeType,
    /// App metadata.
    pub app_meta_data: Option<String>,
    /// Expiry resets so far.
    pub number_retries: u32,
}

fn pending_download(tables: &ReplicaTables, tracker: &DownloadFileTracker) -> Option<PendingDownload> {
    let object = tables.download_objects.get(tracker.object_id)?;
    let (_, entry) = tables.file_entry(tracker.file_uuid)?;
    Some(PendingDownload {
        file_uuid: tracker.file_uuid,
        file_group_uuid: object.file_group_uuid,
        file_version: tracker.file_version,
        file_label: entry.file_label.clone(),
        mime_type: entry.mime_type.clone(),
        app_meta_data: tracker.app_meta_data.clone(),
        number_retries: tracker.number_retries,
    })
}

/// Files that may start now, in queue order, at most `limit`.
#[must_use]
pub fn next_downloads(tables: &ReplicaTables, limit: usize) -> Vec<PendingDownload> {
    tables
        .download_files
        .filter(|t| t.status == DownloadStatus::NotStarted)
        .filter_map(|(_, t)| pending_download(tables, t))
        .take(limit)
        .collect()
}

/// Marks a file as handed to the transport under `task_identifier`.
///
/// # Errors
///
/// Fails if the file has no download tracker or it is not `notStarted`.
pub fn begin_download(
    txn: &mut Tx<'_>,
    file_uuid: FileUuid,
    task_identifier: &str,
    now: Timestamp,
    expiry: Duration,
) -> ReplicaResult<PendingDownload> {
    let (id, tracker) = txn
        .tables()
        .download_file(file_uuid)
        .map(|(id, t)| (id, t.clone()))
        .ok_or_else(|| ReplicaError::UnknownTracker(format!("download of file {file_uuid}")))?;
    if tracker.status != DownloadStatus::NotStarted {
        return Err(ReplicaError::invalid_transition(
            format!("download of file {file_uuid}"),
            format!("{:?}", tracker.status),
            "downloading",
        ));
    }
    let pending = pending_download(txn.tables(), &tracker)
        .ok_or_else(|| ReplicaError::NoObject(format!("file {file_uuid}")))?;

    let entry_id = network_cache::create(
        txn,
        task_identifier,
        file_uuid,
        Some(tracker.file_version),
        Direction::Download,
    )?;
    txn.modify::<DownloadFileTracker, _>(id, |t| {
        t.status = DownloadStatus::Downloading;
        t.expiry = Some(now.saturating_add(expiry));
        t.network_cache_id = Some(entry_id);
    })?;
    tracing::debug!(file = %file_uuid, task_identifier, "download started");
    Ok(pending)
}

/// Applies a recorded download outcome to the tracker owning ledger entry
/// `entry_id`, then removes the entry. Returns false if no tracker owned it.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn consume(txn: &mut Tx<'_>, entry_id: RowId, body: &DownloadBody) -> ReplicaResult<bool> {
    let owner = txn
        .tables()
        .download_files
        .find(|t| t.network_cache_id == Some(entry_id))
        .map(|(id, t)| (id, t.file_uuid));
    if txn.get::<NetworkCacheEntry>(entry_id).is_some() {
        txn.delete::<NetworkCacheEntry>(entry_id)?;
    }
    let Some((id, file_uuid)) = owner else {
        tracing::debug!(entry = %entry_id, "dropped download outcome without a tracker");
        return Ok(false);
    };

    match body {
        DownloadBody::Downloaded { location, checksum } => {
            txn.modify::<DownloadFileTracker, _>(id, |t| {
                t.status = DownloadStatus::Downloaded;
                t.local_url = Some(location.clone());
                t.check_sum.clone_from(checksum);
                t.expiry = None;
                t.network_cache_id = None;
            })?;
        }
        DownloadBody::Gone(reason) => {
            let reason = *reason;
            txn.modify::<DownloadFileTracker, _>(id, |t| {
                t.status = DownloadStatus::Downloaded;
                t.gone_reason = Some(reason);
                t.expiry = None;
                t.network_cache_id = None;
            })?;
            directory::set_gone(txn, file_uuid, reason)?;
        }
    }
    tracing::debug!(file = %file_uuid, outcome = ?body, "download outcome consumed");
    Ok(true)
}

/// A downloaded file waiting for the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedDownload {
    /// File.
    pub file_uuid: FileUuid,
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Downloaded version.
    pub file_version: FileVersion,
    /// Where the content landed; unset for gone files.
    pub local_url: Option<PathBuf>,
    /// Checksum reported with the content.
    pub check_sum: Option<String>,
    /// Set when the server reported the file gone.
    pub gone_reason: Option<GoneReason>,
    /// App metadata.
    pub app_meta_data: Option<String>,
}

/// Downloaded files the app has not taken yet.
#[must_use]
pub fn completed_downloads(tables: &ReplicaTables) -> Vec<CompletedDownload> {
    tables
        .download_files
        .filter(|t| t.status == DownloadStatus::Downloaded)
        .filter_map(|(_, t)| {
            let object = tables.download_objects.get(t.object_id)?;
            Some(CompletedDownload {
                file_uuid: t.file_uuid,
                file_group_uuid: object.file_group_uuid,
                file_version: t.file_version,
                local_url: t.local_url.clone(),
                check_sum: t.check_sum.clone(),
                gone_reason: t.gone_reason,
                app_meta_data: t.app_meta_data.clone(),
            })
        })
        .collect()
}

fn delete_object_if_empty(txn: &mut Tx<'_>, object_id: RowId) -> ReplicaResult<bool> {
    if txn.tables().download_files_of(object_id).next().is_some() {
        return Ok(false);
    }
    let object = txn.delete::<DownloadObjectTracker>(object_id)?;
    tracing::info!(group = %object.file_group_uuid, "download finished");
    Ok(true)
}

/// Clears a downloaded file's tracker, and its object tracker once no
/// sibling remains. Returns true if the object tracker was removed.
///
/// The directory version is updated only when `version` is given.
///
/// # Errors
///
/// Fails if the file has no tracker or is not downloaded.
pub fn mark_file_downloaded(
    txn: &mut Tx<'_>,
    file_uuid: FileUuid,
    version: Option<FileVersion>,
) -> ReplicaResult<bool> {
    let (id, status, object_id) = txn
        .tables()
        .download_file(file_uuid)
        .map(|(id, t)| (id, t.status, t.object_id))
        .ok_or_else(|| ReplicaError::UnknownTracker(format!("download of file {file_uuid}")))?;
    if status != DownloadStatus::Downloaded {
        return Err(ReplicaError::invalid_transition(
            format!("download of file {file_uuid}"),
            format!("{status:?}"),
            "taken",
        ));
    }
    txn.delete::<DownloadFileTracker>(id)?;
    if let Some(version) = version {
        directory::set_file_version(txn, file_uuid, version)?;
    }
    delete_object_if_empty(txn, object_id)
}

/// Clears every file tracker of a downloaded file group and the group's
/// tracker. Returns the number of files cleared.
///
/// With `record_versions`, each file's downloaded version becomes its
/// directory version; gone files are skipped.
///
/// # Errors
///
/// Fails if the group has no tracker or a file is not downloaded.
pub fn mark_object_downloaded(
    txn: &mut Tx<'_>,
    group: FileGroupUuid,
    record_versions: bool,
) -> ReplicaResult<usize> {
    let (object_id, _) = txn
        .tables()
        .download_object(group)
        .ok_or_else(|| ReplicaError::UnknownTracker(format!("download of file group {group}")))?;
    let files: Vec<(RowId, DownloadFileTracker)> = txn
        .tables()
        .download_files_of(object_id)
        .map(|(id, t)| (id, t.clone()))
        .collect();
    if let Some((_, t)) = files.iter().find(|(_, t)| t.status != DownloadStatus::Downloaded) {
        return Err(ReplicaError::invalid_transition(
            format!("download of file {}", t.file_uuid),
            format!("{:?}", t.status),
            "taken",
        ));
    }
    for (id, tracker) in &files {
        txn.delete::<DownloadFileTracker>(*id)?;
        if record_versions && tracker.gone_reason.is_none() {
            directory::set_file_version(txn, tracker.file_uuid, tracker.file_version)?;
        }
    }
    delete_object_if_empty(txn, object_id)?;
    Ok(files.len())
}

/// Resets `downloading` files whose expiry has passed. Files whose outcome
/// is already recorded are left for reattachment.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn reset_expired(txn: &mut Tx<'_>, now: Timestamp) -> ReplicaResult<Vec<ExpiredReset>> {
    let expired: Vec<(RowId, DownloadFileTracker)> = txn
        .tables()
        .download_files
        .filter(|t| t.status == DownloadStatus::Downloading && t.expiry.is_some_and(|e| e <= now))
        .map(|(id, t)| (id, t.clone()))
        .collect();

    let mut resets = Vec::new();
    for (id, tracker) in expired {
        if let Some(entry_id) = tracker.network_cache_id {
            match txn.get::<NetworkCacheEntry>(entry_id).map(|e| e.transfer.is_complete()) {
                Some(true) => continue,
                Some(false) => {
                    txn.delete::<NetworkCacheEntry>(entry_id)?;
                }
                None => {}
            }
        }
        let retries = tracker.number_retries.saturating_add(1);
        txn.modify::<DownloadFileTracker, _>(id, |t| {
            t.status = DownloadStatus::NotStarted;
            t.expiry = None;
            t.network_cache_id = None;
            t.number_retries = retries;
        })?;
        resets.push(ExpiredReset {
            uuid: tracker.file_uuid.0,
            number_retries: retries,
        });
    }
    Ok(resets)
}
