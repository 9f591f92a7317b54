//! Upload queue.
//!
//! Each `queue` call becomes one batch: an [`UploadObjectTracker`] plus one
//! [`UploadFileTracker`] per file. A batch is either all first versions (v0)
//! or all updates (vN). Only the oldest batch of a file group runs; later
//! batches for the same group wait until it has been cleaned up, and the
//! store rejects a second started batch per group outright.
//!
//! ```text
//! notStarted --begin_upload--> uploading --outcome--> uploaded
//!      ^                           |
//!      +------- expiry reset ------+
//! ```
//!
//! A v0 batch is finished, and its rows deleted, in the transaction that
//! consumes its last outcome. A vN batch waits for the server's deferred
//! completion, confirmed through [`confirm_deferred_upload`].

use crate::declared::declared_object;
use crate::directory::{self, check_file, check_object, LocalFile, LocalObject};
use crate::error::{ReplicaError, ReplicaResult};
use crate::hasher::ContentHasher;
use crate::network_cache::{self, Direction, UploadBody};
use crate::recovery::ExpiredReset;
use crate::schema::{
    NetworkCacheEntry, ReplicaTables, StagingOrigin, StoredSource, Tx, UploadFileTracker,
    UploadObjectTracker, UploadStatus, VersionClass,
};
use crate::types::{
    BatchUuid, CloudStorageType, FileGroupUuid, FileUuid, FileVersion, MimeType, SharingGroupUuid,
    Timestamp,
};
use replica_store::RowId;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Where the content of a queued file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    /// A caller file that may change; it is copied into staging.
    Copy(PathBuf),
    /// In-memory content; it is written into staging.
    Data(Vec<u8>),
    /// A caller file promised not to change until the upload finishes.
    Immutable(PathBuf),
}

/// One file of an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// File.
    pub file_uuid: FileUuid,
    /// Declared label.
    pub file_label: String,
    /// MIME type; may be omitted when the label declares exactly one.
    pub mime_type: Option<MimeType>,
    /// Content.
    pub source: UploadSource,
    /// App metadata.
    pub app_meta_data: Option<String>,
}

impl UploadFile {
    /// Creates a file upload.
    pub fn new(file_uuid: FileUuid, file_label: impl Into<String>, source: UploadSource) -> Self {
        Self {
            file_uuid,
            file_label: file_label.into(),
            mime_type: None,
            source,
            app_meta_data: None,
        }
    }

    /// Sets the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: MimeType) -> Self {
        self.mime_type = Some(mime_type);
        self
    }

    /// Sets the app metadata.
    #[must_use]
    pub fn with_app_meta_data(mut self, app_meta_data: impl Into<String>) -> Self {
        self.app_meta_data = Some(app_meta_data.into());
        self
    }
}

/// An upload request for one file group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadableObject {
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Registered object type.
    pub object_type: String,
    /// Sharing group.
    pub sharing_group_uuid: SharingGroupUuid,
    /// Storage provider.
    pub cloud_storage_type: CloudStorageType,
    /// Message pushed to other clients.
    pub push_notification_message: Option<String>,
    /// Files to upload.
    pub files: Vec<UploadFile>,
}

impl UploadableObject {
    /// Creates an upload request.
    pub fn new(
        file_group_uuid: FileGroupUuid,
        object_type: impl Into<String>,
        sharing_group_uuid: SharingGroupUuid,
        cloud_storage_type: CloudStorageType,
        files: Vec<UploadFile>,
    ) -> Self {
        Self {
            file_group_uuid,
            object_type: object_type.into(),
            sharing_group_uuid,
            cloud_storage_type,
            push_notification_message: None,
            files,
        }
    }

    /// Sets the push notification message.
    #[must_use]
    pub fn with_push_notification(mut self, message: impl Into<String>) -> Self {
        self.push_notification_message = Some(message.into());
        self
    }
}

/// A validated file of an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// File.
    pub file_uuid: FileUuid,
    /// Declared label.
    pub file_label: String,
    /// Resolved MIME type.
    pub mime_type: MimeType,
    /// Declared change resolver.
    pub change_resolver_name: Option<String>,
}

/// A validated upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    /// First upload or update.
    pub version_class: VersionClass,
    /// Files in request order.
    pub files: Vec<PlannedFile>,
}

/// Validates an upload request against declarations and the directory.
///
/// A file counts as vN if it has a local or server version, or if an earlier
/// upload of it is still outstanding.
///
/// # Errors
///
/// Returns the first validation or integrity failure; nothing is written.
pub fn plan(tables: &ReplicaTables, object: &UploadableObject) -> ReplicaResult<UploadPlan> {
    let group = object.file_group_uuid;
    if object.files.is_empty() {
        return Err(ReplicaError::EmptyRequest);
    }
    let mut seen = HashSet::new();
    if !object.files.iter().all(|f| seen.insert(f.file_uuid)) {
        return Err(ReplicaError::UploadsDoNotHaveDistinctUUIDs);
    }

    let declared = declared_object(tables, &object.object_type)
        .ok_or_else(|| ReplicaError::UnknownObjectType(object.object_type.clone()))?;

    if let Some((_, entry)) = tables.object_entry(group) {
        check_object(
            entry,
            &object.object_type,
            object.sharing_group_uuid,
            object.cloud_storage_type,
        )?;
        if entry.deleted_locally || entry.deleted_on_server {
            return Err(ReplicaError::AttemptToQueueADeletedFile(format!("file group {group}")));
        }
    }
    if tables.deletion(group.0).is_some() {
        return Err(ReplicaError::AttemptToQueueADeletedFile(format!("file group {group}")));
    }

    let mut classes = HashSet::new();
    let mut files = Vec::with_capacity(object.files.len());
    for file in &object.files {
        let declared_file = declared.file(&file.file_label).ok_or_else(|| ReplicaError::UnknownFileLabel {
            object_type: object.object_type.clone(),
            file_label: file.file_label.clone(),
        })?;
        let mime_type = declared_file.resolve_mime_type(file.mime_type.as_ref())?;

        let mut has_version = false;
        if let Some((_, entry)) = tables.file_entry(file.file_uuid) {
            check_file(entry, group, &file.file_label, &mime_type)?;
            if entry.deleted_locally || entry.deleted_on_server {
                return Err(ReplicaError::AttemptToQueueADeletedFile(format!("file {}", file.file_uuid)));
            }
            has_version = entry.file_version.is_some() || entry.server_file_version.is_some();
        }
        if tables.deletion(file.file_uuid.0).is_some() {
            return Err(ReplicaError::AttemptToQueueADeletedFile(format!("file {}", file.file_uuid)));
        }
        let outstanding = tables
            .upload_files
            .find(|t| t.file_uuid == file.file_uuid)
            .is_some();
        classes.insert(if has_version || outstanding {
            VersionClass::VN
        } else {
            VersionClass::V0
        });

        files.push(PlannedFile {
            file_uuid: file.file_uuid,
            file_label: file.file_label.clone(),
            mime_type,
            change_resolver_name: declared_file.change_resolver_name.clone(),
        });
    }

    if classes.len() > 1 {
        return Err(ReplicaError::SomeUploadFilesV0SomeVN(group));
    }
    let version_class = if classes.contains(&VersionClass::VN) {
        VersionClass::VN
    } else {
        VersionClass::V0
    };
    if version_class == VersionClass::VN {
        if let Some(file) = files.iter().find(|f| f.change_resolver_name.is_none()) {
            return Err(ReplicaError::NoChangeResolver {
                object_type: object.object_type.clone(),
                file_label: file.file_label.clone(),
            });
        }
    }
    Ok(UploadPlan { version_class, files })
}

/// Content ready to be recorded in a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedContent {
    /// Where the content lives.
    pub source: StoredSource,
    /// Checksum of the content.
    pub check_sum: String,
    /// What a staged copy was made from.
    pub origin: Option<StagingOrigin>,
}

fn write_staged(origin: &StagingOrigin, target: &Path, hasher: &dyn ContentHasher) -> ReplicaResult<String> {
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)?;
    }
    match origin {
        StagingOrigin::Copy(path) => {
            fs::copy(path, target)?;
            Ok(hasher.checksum_file(target)?)
        }
        StagingOrigin::Data(bytes) => {
            fs::write(target, bytes)?;
            Ok(hasher.checksum(bytes))
        }
    }
}

/// Stages one file's content and checksums it.
///
/// # Errors
///
/// Fails if content must be copied and there is no staging directory, or on
/// I/O failure.
pub fn stage(
    source: &UploadSource,
    file_uuid: FileUuid,
    staging_dir: Option<&Path>,
    hasher: &dyn ContentHasher,
) -> ReplicaResult<StagedContent> {
    let origin = match source {
        UploadSource::Immutable(path) => {
            return Ok(StagedContent {
                check_sum: hasher.checksum_file(path)?,
                source: StoredSource::Reference(path.clone()),
                origin: None,
            })
        }
        UploadSource::Copy(path) => StagingOrigin::Copy(path.clone()),
        UploadSource::Data(bytes) => StagingOrigin::Data(bytes.clone()),
    };
    let dir = staging_dir.ok_or(ReplicaError::StagingUnavailable)?;
    let target = dir.join(format!("{file_uuid}-{}", Uuid::new_v4().simple()));
    let check_sum = write_staged(&origin, &target, hasher)?;
    Ok(StagedContent {
        check_sum,
        source: StoredSource::Staged(target),
        origin: Some(origin),
    })
}

/// A released copy the next start of `file_uuid` has to write again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restage {
    /// Path the copy is written to.
    pub path: PathBuf,
    /// What the copy is made from.
    pub origin: StagingOrigin,
}

/// The released copy `begin_upload` of `file_uuid` would need, if any.
#[must_use]
pub fn restage_needed(tables: &ReplicaTables, file_uuid: FileUuid) -> Option<Restage> {
    let (file_id, _) = startable(tables, file_uuid).ok()?;
    let tracker = tables.upload_files.get(file_id)?;
    match (&tracker.source, &tracker.origin) {
        (StoredSource::Released(path), Some(origin)) => Some(Restage {
            path: path.clone(),
            origin: origin.clone(),
        }),
        _ => None,
    }
}

/// Writes a released copy again and returns its checksum.
///
/// # Errors
///
/// Fails on I/O failure, including a caller file that no longer exists.
pub fn restage(restage: &Restage, hasher: &dyn ContentHasher) -> ReplicaResult<String> {
    write_staged(&restage.origin, &restage.path, hasher)
}

/// Removes staged copies the replica no longer needs. Failures are logged.
pub fn discard_staged(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove staged upload");
            }
        }
    }
}

fn staged_paths<'a>(sources: impl IntoIterator<Item = &'a StoredSource>) -> Vec<PathBuf> {
    sources
        .into_iter()
        .filter_map(|s| match s {
            StoredSource::Staged(path) => Some(path.clone()),
            StoredSource::Reference(_) | StoredSource::Released(_) => None,
        })
        .collect()
}

/// Staged copies owned by a list of staged contents.
#[must_use]
pub fn staged_copies(contents: &[StagedContent]) -> Vec<PathBuf> {
    staged_paths(contents.iter().map(|c| &c.source))
}

/// Result of queuing an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUpload {
    /// Batch id.
    pub batch_uuid: BatchUuid,
    /// Object tracker row.
    pub tracker_id: RowId,
    /// First upload or update.
    pub version_class: VersionClass,
    /// Another batch of the group is ahead of this one.
    pub waiting: bool,
}

/// Queues a validated, staged upload. `staged` is in request order.
///
/// # Errors
///
/// Re-validates inside the transaction and fails like [`plan`].
pub fn queue(
    txn: &mut Tx<'_>,
    object: &UploadableObject,
    staged: Vec<StagedContent>,
    now: Timestamp,
    batch_expiry_interval: Duration,
) -> ReplicaResult<QueuedUpload> {
    let plan = plan(txn.tables(), object)?;
    if staged.len() != plan.files.len() {
        return Err(ReplicaError::invalid_transition(
            format!("upload of file group {}", object.file_group_uuid),
            format!("{} staged files", staged.len()),
            format!("{} queued files", plan.files.len()),
        ));
    }

    let local_files: Vec<LocalFile<'_>> = plan
        .files
        .iter()
        .zip(&object.files)
        .map(|(planned, file)| LocalFile {
            file_uuid: planned.file_uuid,
            file_label: &planned.file_label,
            mime_type: &planned.mime_type,
            app_meta_data: file.app_meta_data.as_deref(),
        })
        .collect();
    directory::upsert_for_upload(
        txn,
        LocalObject {
            file_group_uuid: object.file_group_uuid,
            object_type: &object.object_type,
            sharing_group_uuid: object.sharing_group_uuid,
            cloud_storage_type: object.cloud_storage_type,
        },
        &local_files,
    )?;

    let waiting = txn.tables().upload_batches(object.file_group_uuid).next().is_some();
    let batch_uuid = BatchUuid::random();
    let tracker_id = txn.insert(UploadObjectTracker {
        file_group_uuid: object.file_group_uuid,
        batch_uuid,
        batch_expiry_interval_ms: u64::try_from(batch_expiry_interval.as_millis()).unwrap_or(u64::MAX),
        version_class: plan.version_class,
        v0_upload: None,
        deferred_upload_id: None,
        push_notification_message: object.push_notification_message.clone(),
        object_type: object.object_type.clone(),
        sharing_group_uuid: object.sharing_group_uuid,
        cloud_storage_type: object.cloud_storage_type,
        started: false,
        queued_at: now,
    })?;

    let count = u32::try_from(plan.files.len()).unwrap_or(u32::MAX);
    for (index, ((planned, file), content)) in plan.files.iter().zip(&object.files).zip(staged).enumerate() {
        txn.insert(UploadFileTracker {
            object_id: tracker_id,
            file_uuid: planned.file_uuid,
            file_label: planned.file_label.clone(),
            mime_type: planned.mime_type.clone(),
            status: UploadStatus::NotStarted,
            number_retries: 0,
            file_version: None,
            source: content.source,
            origin: content.origin,
            check_sum: content.check_sum,
            app_meta_data: file.app_meta_data.clone(),
            change_resolver_name: planned.change_resolver_name.clone(),
            upload_index: u32::try_from(index + 1).unwrap_or(u32::MAX),
            upload_count: count,
            expiry: None,
            network_cache_id: None,
        })?;
    }

    tracing::info!(
        group = %object.file_group_uuid,
        batch = %batch_uuid,
        files = count,
        class = ?plan.version_class,
        waiting,
        "upload queued"
    );
    Ok(QueuedUpload {
        batch_uuid,
        tracker_id,
        version_class: plan.version_class,
        waiting,
    })
}

/// Oldest batch of each file group, in queue order.
fn head_batches(tables: &ReplicaTables) -> Vec<RowId> {
    let mut groups = HashSet::new();
    tables
        .upload_objects
        .iter()
        .filter(|(_, t)| groups.insert(t.file_group_uuid))
        .map(|(id, _)| id)
        .collect()
}

/// A file ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    /// File.
    pub file_uuid: FileUuid,
    /// File group.
    pub file_group_uuid: FileGroupUuid,
    /// Sharing group.
    pub sharing_group_uuid: SharingGroupUuid,
    /// Storage provider.
    pub cloud_storage_type: CloudStorageType,
    /// Object type.
    pub object_type: String,
    /// Batch id.
    pub batch_uuid: BatchUuid,
    /// Server-side batch expiry.
    pub batch_expiry_interval: Duration,
    /// First upload or update.
    pub version_class: VersionClass,
    /// Version the upload creates.
    pub file_version: FileVersion,
    /// Declared label.
    pub file_label: String,
    /// MIME type.
    pub mime_type: MimeType,
    /// Content path. After an expiry reset the copy exists again only once
    /// the file has been started.
    pub content: PathBuf,
    /// Content checksum.
    pub check_sum: String,
    /// App metadata.
    pub app_meta_data: Option<String>,
    /// Change resolver for updates.
    pub change_resolver_name: Option<String>,
    /// Message pushed to other clients.
    pub push_notification_message: Option<String>,
    /// 1-based position within the batch.
    pub upload_index: u32,
    /// Files in the batch.
    pub upload_count: u32,
    /// Expiry resets so far.
    pub number_retries: u32,
}

fn upload_version(tables: &ReplicaTables, class: VersionClass, file: FileUuid) -> FileVersion {
    match class {
        VersionClass::V0 => 0,
        VersionClass::VN => tables
            .file_entry(file)
            .and_then(|(_, e)| e.file_version.or(e.server_file_version))
            .map_or(0, |v| v.saturating_add(1)),
    }
}

fn pending_upload(
    tables: &ReplicaTables,
    object: &UploadObjectTracker,
    file: &UploadFileTracker,
) -> PendingUpload {
    PendingUpload {
        file_uuid: file.file_uuid,
        file_group_uuid: object.file_group_uuid,
        sharing_group_uuid: object.sharing_group_uuid,
        cloud_storage_type: object.cloud_storage_type,
        object_type: object.object_type.clone(),
        batch_uuid: object.batch_uuid,
        batch_expiry_interval: Duration::from_millis(object.batch_expiry_interval_ms),
        version_class: object.version_class,
        file_version: upload_version(tables, object.version_class, file.file_uuid),
        file_label: file.file_label.clone(),
        mime_type: file.mime_type.clone(),
        content: file.source.path().clone(),
        check_sum: file.check_sum.clone(),
        app_meta_data: file.app_meta_data.clone(),
        change_resolver_name: file.change_resolver_name.clone(),
        push_notification_message: object.push_notification_message.clone(),
        upload_index: file.upload_index,
        upload_count: file.upload_count,
        number_retries: file.number_retries,
    }
}

/// Files that may start now, oldest batch first, at most `limit`.
#[must_use]
pub fn next_uploads(tables: &ReplicaTables, limit: usize) -> Vec<PendingUpload> {
    let mut pending = Vec::new();
    for object_id in head_batches(tables) {
        let Some(object) = tables.upload_objects.get(object_id) else {
            continue;
        };
        for (_, file) in tables.upload_files_of(object_id) {
            if pending.len() >= limit {
                return pending;
            }
            if file.status == UploadStatus::NotStarted {
                pending.push(pending_upload(tables, object, file));
            }
        }
    }
    pending
}

/// File and batch tracker rows of the upload of `file_uuid` that may start now.
fn startable(tables: &ReplicaTables, file_uuid: FileUuid) -> ReplicaResult<(RowId, RowId)> {
    let heads = head_batches(tables);
    let mut blocked = None;
    for (id, tracker) in tables.upload_files.filter(|t| t.file_uuid == file_uuid) {
        if !heads.contains(&tracker.object_id) {
            blocked = Some("waiting behind an earlier batch".to_string());
        } else if tracker.status == UploadStatus::NotStarted {
            return Ok((id, tracker.object_id));
        } else {
            blocked = Some(format!("{:?}", tracker.status));
        }
    }
    Err(match blocked {
        Some(from) => ReplicaError::invalid_transition(format!("upload of file {file_uuid}"), from, "uploading"),
        None => ReplicaError::UnknownTracker(format!("upload of file {file_uuid}")),
    })
}

/// Marks a file as handed to the transport under `task_identifier`.
///
/// Records the ledger entry and, the first time a file of the batch starts,
/// marks the batch started. A copy released by an expiry reset must have
/// been written again by [`restage`]; `restaged` carries its checksum.
///
/// # Errors
///
/// Fails if the file has no upload that may start now, or if its copy was
/// released and not written again.
pub fn begin_upload(
    txn: &mut Tx<'_>,
    file_uuid: FileUuid,
    task_identifier: &str,
    now: Timestamp,
    expiry: Duration,
    restaged: Option<String>,
) -> ReplicaResult<PendingUpload> {
    let (file_id, object_id) = startable(txn.tables(), file_uuid)?;

    let source = txn.tables().upload_files.get(file_id).map(|t| t.source.clone());
    if let Some(StoredSource::Released(path)) = source {
        let Some(check_sum) = restaged else {
            return Err(ReplicaError::invalid_transition(
                format!("upload of file {file_uuid}"),
                "staged copy released",
                "uploading",
            ));
        };
        txn.modify::<UploadFileTracker, _>(file_id, |t| {
            t.source = StoredSource::Staged(path);
            t.check_sum = check_sum;
        })?;
    }

    let (object, file) = match (
        txn.tables().upload_objects.get(object_id),
        txn.tables().upload_files.get(file_id),
    ) {
        (Some(object), Some(file)) => (object.clone(), file.clone()),
        _ => return Err(ReplicaError::UnknownTracker(format!("upload of file {file_uuid}"))),
    };
    let pending = pending_upload(txn.tables(), &object, &file);

    let entry_id = network_cache::create(
        txn,
        task_identifier,
        file_uuid,
        Some(pending.file_version),
        Direction::Upload,
    )?;
    txn.modify::<UploadFileTracker, _>(file_id, |t| {
        t.status = UploadStatus::Uploading;
        t.expiry = Some(now.saturating_add(expiry));
        t.network_cache_id = Some(entry_id);
    })?;
    if !object.started {
        txn.modify::<UploadObjectTracker, _>(object_id, |t| {
            t.started = true;
            t.v0_upload = Some(t.version_class == VersionClass::V0);
        })?;
    }

    tracing::debug!(file = %file_uuid, task_identifier, batch = %object.batch_uuid, "upload started");
    Ok(pending)
}

/// What consuming an upload outcome did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadConsumed {
    /// The ledger entry had no live tracker and was dropped.
    pub orphan: bool,
    /// The batch finished and its rows were deleted.
    pub batch_finished: bool,
    /// Staged copies to remove once the transaction commits.
    pub released: Vec<PathBuf>,
}

fn delete_batch(txn: &mut Tx<'_>, object_id: RowId) -> ReplicaResult<Vec<PathBuf>> {
    let files: Vec<RowId> = txn.tables().upload_files_of(object_id).map(|(id, _)| id).collect();
    let mut sources = Vec::with_capacity(files.len());
    for id in files {
        let tracker = txn.delete::<UploadFileTracker>(id)?;
        if let Some(entry_id) = tracker.network_cache_id {
            if txn.get::<NetworkCacheEntry>(entry_id).is_some() {
                txn.delete::<NetworkCacheEntry>(entry_id)?;
            }
        }
        sources.push(tracker.source);
    }
    txn.delete::<UploadObjectTracker>(object_id)?;
    Ok(staged_paths(&sources))
}

fn finish_if_complete(txn: &mut Tx<'_>, object_id: RowId) -> ReplicaResult<Option<Vec<PathBuf>>> {
    let Some(object) = txn.get::<UploadObjectTracker>(object_id).cloned() else {
        return Ok(None);
    };
    let files: Vec<&UploadFileTracker> = txn.tables().upload_files_of(object_id).map(|(_, f)| f).collect();
    if files.iter().any(|f| f.status != UploadStatus::Uploaded) {
        return Ok(None);
    }
    let all_gone = files.iter().all(|f| {
        txn.tables()
            .file_entry(f.file_uuid)
            .is_some_and(|(_, e)| e.gone_reason.is_some())
    });
    if object.version_class == VersionClass::VN && !all_gone {
        return Ok(None);
    }
    let released = delete_batch(txn, object_id)?;
    tracing::info!(group = %object.file_group_uuid, batch = %object.batch_uuid, "upload batch finished");
    Ok(Some(released))
}

/// Applies a recorded upload outcome to the tracker owning ledger entry
/// `entry_id`, then removes the entry.
///
/// For a v0 batch the directory version is set in the same transaction, and
/// the batch rows are deleted once every file is uploaded.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn consume(txn: &mut Tx<'_>, entry_id: RowId, body: &UploadBody) -> ReplicaResult<UploadConsumed> {
    let mut consumed = UploadConsumed::default();
    let owner = txn
        .tables()
        .upload_files
        .find(|t| t.network_cache_id == Some(entry_id))
        .map(|(id, t)| (id, t.clone()));
    let entry = txn.get::<NetworkCacheEntry>(entry_id).cloned();

    let Some((file_id, tracker)) = owner else {
        if entry.is_some() {
            txn.delete::<NetworkCacheEntry>(entry_id)?;
        }
        tracing::debug!(entry = %entry_id, "dropped upload outcome without a tracker");
        consumed.orphan = true;
        return Ok(consumed);
    };
    let Some(object) = txn.get::<UploadObjectTracker>(tracker.object_id).cloned() else {
        return Err(ReplicaError::UnknownTracker(format!("upload batch of file {}", tracker.file_uuid)));
    };

    let mut file_version = None;
    match body {
        UploadBody::Gone(reason) => {
            directory::set_gone(txn, tracker.file_uuid, *reason)?;
        }
        UploadBody::Stored | UploadBody::V0BatchComplete | UploadBody::VNBatchDeferred { .. } => {
            match object.version_class {
                VersionClass::V0 => {
                    directory::set_file_version(txn, tracker.file_uuid, 0)?;
                    file_version = Some(0);
                }
                VersionClass::VN => {
                    file_version = entry.as_ref().and_then(|e| e.file_version);
                }
            }
            if let UploadBody::VNBatchDeferred { deferred_upload_id } = body {
                let deferred = *deferred_upload_id;
                txn.modify::<UploadObjectTracker, _>(tracker.object_id, |t| {
                    t.deferred_upload_id = Some(deferred);
                })?;
            }
        }
    }

    txn.modify::<UploadFileTracker, _>(file_id, |t| {
        t.status = UploadStatus::Uploaded;
        t.expiry = None;
        t.network_cache_id = None;
        t.file_version = file_version;
    })?;
    if entry.is_some() {
        txn.delete::<NetworkCacheEntry>(entry_id)?;
    }
    tracing::debug!(file = %tracker.file_uuid, outcome = ?body, "upload outcome consumed");

    if let Some(released) = finish_if_complete(txn, tracker.object_id)? {
        consumed.batch_finished = true;
        consumed.released = released;
    }
    Ok(consumed)
}

/// Confirms the server finished a deferred update batch.
///
/// Bumps each file's directory version and deletes the batch.
///
/// # Errors
///
/// Fails if no batch waits for `deferred_upload_id` or a file of the batch is
/// not uploaded.
pub fn confirm_deferred_upload(txn: &mut Tx<'_>, deferred_upload_id: u64) -> ReplicaResult<UploadConsumed> {
    let (object_id, object) = txn
        .tables()
        .upload_objects
        .find(|t| t.deferred_upload_id == Some(deferred_upload_id))
        .map(|(id, t)| (id, t.clone()))
        .ok_or_else(|| ReplicaError::UnknownTracker(format!("deferred upload {deferred_upload_id}")))?;

    let files: Vec<UploadFileTracker> = txn.tables().upload_files_of(object_id).map(|(_, f)| f.clone()).collect();
    if let Some(file) = files.iter().find(|f| f.status != UploadStatus::Uploaded) {
        return Err(ReplicaError::invalid_transition(
            format!("upload of file {}", file.file_uuid),
            format!("{:?}", file.status),
            "confirmed",
        ));
    }
    for file in &files {
        let Some((_, entry)) = txn.tables().file_entry(file.file_uuid) else {
            return Err(ReplicaError::NoObject(format!("file {}", file.file_uuid)));
        };
        if entry.gone_reason.is_some() {
            continue;
        }
        let next = file
            .file_version
            .unwrap_or_else(|| entry.file_version.or(entry.server_file_version).map_or(0, |v| v.saturating_add(1)));
        directory::set_file_version(txn, file.file_uuid, next)?;
    }
    let released = delete_batch(txn, object_id)?;
    tracing::info!(
        group = %object.file_group_uuid,
        batch = %object.batch_uuid,
        deferred_upload_id,
        "deferred upload confirmed"
    );
    Ok(UploadConsumed {
        orphan: false,
        batch_finished: true,
        released,
    })
}

/// Uploads reset by an expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResets {
    /// Reset files.
    pub resets: Vec<ExpiredReset>,
    /// Staged copies to remove once the transaction commits.
    pub released: Vec<PathBuf>,
}

/// Resets `uploading` files whose expiry has passed.
///
/// Staged copies are released; the next [`begin_upload`] writes them again
/// from their origin. Files whose outcome is already recorded are left for
/// reattachment instead.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn reset_expired(txn: &mut Tx<'_>, now: Timestamp) -> ReplicaResult<UploadResets> {
    let expired: Vec<(RowId, UploadFileTracker)> = txn
        .tables()
        .upload_files
        .filter(|t| t.status == UploadStatus::Uploading && t.expiry.is_some_and(|e| e <= now))
        .map(|(id, t)| (id, t.clone()))
        .collect();

    let mut out = UploadResets::default();
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
        let released = match (&tracker.source, &tracker.origin) {
            (StoredSource::Staged(path), Some(_)) => Some(path.clone()),
            _ => None,
        };
        let retries = tracker.number_retries.saturating_add(1);
        txn.modify::<UploadFileTracker, _>(id, |t| {
            t.status = UploadStatus::NotStarted;
            t.expiry = None;
            t.network_cache_id = None;
            t.number_retries = retries;
            if let Some(path) = &released {
                t.source = StoredSource::Released(path.clone());
            }
        })?;
        out.released.extend(released);
        out.resets.push(ExpiredReset {
            uuid: tracker.file_uuid.0,
            number_retries: retries,
        });
    }
    Ok(out)
}

/// Deferred upload ids the server has yet to confirm.
#[must_use]
pub fn pending_deferred(tables: &ReplicaTables) -> Vec<u64> {
    tables
        .upload_objects
        .iter()
        .filter_map(|(_, t)| t.deferred_upload_id)
        .collect()
}
