//! The replica facade.
//!
//! [`Replica`] owns the store and the injected capabilities and runs every
//! operation as one store transaction. Content staging happens outside the
//! transaction; staged copies are removed when the transaction that would
//! have recorded them fails, and after the commit that releases them.

use crate::clock::{Clock, SystemClock};
use crate::config::ReplicaConfig;
use crate::declared::{self, DeclaredObject, RegisterOutcome};
use crate::deletion::{self, DeletionAccepted, DeletionQueued, DeletionTarget, PendingDeletion};
use crate::directory::{self, ObjectDownloadNeed, ServerFileInfo};
use crate::download::{self, CompletedDownload, DownloadRequest, PendingDownload, QueuedDownload};
use crate::error::{ReplicaError, ReplicaResult};
use crate::hasher::{ContentHasher, Sha256Hasher};
use crate::migrations::replica_migrations;
use crate::network_cache::{self, TransferOutcome};
use crate::reconciler::{self, LabelResolver, NoLabelResolver, ReconcileReport};
use crate::recovery::{self, DeferredIds, ReattachReport, SweepReport};
use crate::schema::{FileEntry, NetworkCacheEntry, ObjectEntry, ReplicaTables};
use crate::types::{FileGroupUuid, FileUuid, FileVersion, SharingGroupUuid};
use crate::upload::{self, PendingUpload, QueuedUpload, StagedContent, UploadableObject};
use crate::verify::{self, VerifyReport};
use replica_store::{LogDevice, MigrationReport, SnapshotSlot, Store, StoreDir, StoreStats};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What [`Replica::complete_transfer`] did with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCompletion {
    /// The owning tracker consumed the outcome.
    Consumed,
    /// No tracker owned the transfer; the entry was dropped.
    Orphaned,
    /// The ledger no longer knows the task; the outcome was already consumed.
    AlreadyConsumed,
}

/// The on-device sync replica.
pub struct Replica {
    store: Store<ReplicaTables>,
    config: ReplicaConfig,
    staging_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    hasher: Arc<dyn ContentHasher>,
    resolver: Arc<dyn LabelResolver>,
}

impl Replica {
    /// Opens an on-disk replica with default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked or corrupted, or if migrations or
    /// reattachment fail.
    pub fn open(path: impl AsRef<Path>) -> ReplicaResult<Self> {
        Self::open_with_config(path, ReplicaConfig::default())
    }

    /// Opens an on-disk replica.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked or corrupted, or if migrations or
    /// reattachment fail.
    pub fn open_with_config(path: impl AsRef<Path>, config: ReplicaConfig) -> ReplicaResult<Self> {
        let store = Store::open_with_config(path.as_ref(), config.store.clone())?;
        Self::from_store(store, config)
    }

    /// Opens a fresh in-memory replica. It has no staging directory unless
    /// one is configured.
    ///
    /// # Errors
    ///
    /// Fails if migrations fail.
    pub fn open_in_memory() -> ReplicaResult<Self> {
        Self::open_in_memory_with_config(ReplicaConfig::default())
    }

    /// Opens a fresh in-memory replica with `config`.
    ///
    /// # Errors
    ///
    /// Fails if migrations fail.
    pub fn open_in_memory_with_config(config: ReplicaConfig) -> ReplicaResult<Self> {
        let store = Store::open_in_memory()?;
        Self::from_store(store, config)
    }

    /// Opens a replica over caller-supplied media.
    ///
    /// # Errors
    ///
    /// Fails if the media are corrupted, or if migrations or reattachment
    /// fail.
    pub fn open_with_media(
        config: ReplicaConfig,
        log: Box<dyn LogDevice>,
        snapshot: Box<dyn SnapshotSlot>,
    ) -> ReplicaResult<Self> {
        let store = Store::open_with_media(config.store.clone(), log, snapshot)?;
        Self::from_store(store, config)
    }

    fn from_store(store: Store<ReplicaTables>, config: ReplicaConfig) -> ReplicaResult<Self> {
        let staging_dir = config
            .staging_dir
            .clone()
            .or_else(|| store.dir().map(StoreDir::staging_path));
        let replica = Self {
            store,
            config,
            staging_dir,
            clock: Arc::new(SystemClock),
            hasher: Arc::new(Sha256Hasher),
            resolver: Arc::new(NoLabelResolver),
        };
        if replica.config.migrate_on_open {
            replica.run_migrations()?;
        }
        if replica.config.reattach_on_open {
            replica.reattach_transfers()?;
        }
        Ok(replica)
    }

    /// Sets the resolver for index rows without a type or label.
    #[must_use]
    pub fn with_label_resolver(mut self, resolver: impl LabelResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Sets the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the content hasher.
    #[must_use]
    pub fn with_hasher(mut self, hasher: impl ContentHasher + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Returns the staging directory, if any.
    #[must_use]
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    /// Runs `f` against committed state.
    pub fn read<T>(&self, f: impl FnOnce(&ReplicaTables) -> T) -> T {
        self.store.read(f)
    }

    // Declared objects

    /// Registers an object type and its file labels.
    ///
    /// # Errors
    ///
    /// Fails on an invalid declaration or one that conflicts with an earlier
    /// registration.
    pub fn register(&self, object: &DeclaredObject) -> ReplicaResult<RegisterOutcome> {
        self.store.write(|txn| declared::register(txn, object))
    }

    /// Looks up a registered object type.
    #[must_use]
    pub fn declared_object(&self, object_type: &str) -> Option<DeclaredObject> {
        self.store.read(|t| declared::declared_object(t, object_type))
    }

    /// Every registered object type.
    #[must_use]
    pub fn declared_objects(&self) -> Vec<DeclaredObject> {
        self.store.read(declared::declared_objects)
    }

    // Uploads

    /// Validates, stages and queues an upload.
    ///
    /// # Errors
    ///
    /// Fails on validation errors before anything is staged or written, and
    /// on staging or store failures.
    pub fn queue_upload(&self, object: &UploadableObject) -> ReplicaResult<QueuedUpload> {
        self.store.read(|t| upload::plan(t, object))?;

        let mut staged: Vec<StagedContent> = Vec::with_capacity(object.files.len());
        for file in &object.files {
            match upload::stage(&file.source, file.file_uuid, self.staging_dir.as_deref(), self.hasher.as_ref()) {
                Ok(content) => staged.push(content),
                Err(e) => {
                    upload::discard_staged(&upload::staged_copies(&staged));
                    return Err(e);
                }
            }
        }

        let copies = upload::staged_copies(&staged);
        let now = self.clock.now();
        let result = self
            .store
            .write(|txn| upload::queue(txn, object, staged, now, self.config.batch_expiry_interval));
        if result.is_err() {
            upload::discard_staged(&copies);
        }
        result
    }

    /// Files that may start uploading now.
    #[must_use]
    pub fn next_uploads(&self, limit: usize) -> Vec<PendingUpload> {
        self.store.read(|t| upload::next_uploads(t, limit))
    }

    /// Marks a file as handed to the transport under `task_identifier`.
    ///
    /// # Errors
    ///
    /// Fails if the file has no upload that may start now.
    pub fn begin_upload(&self, file_uuid: FileUuid, task_identifier: &str) -> ReplicaResult<PendingUpload> {
        let restage = self.store.read(|t| upload::restage_needed(t, file_uuid));
        let restaged = match &restage {
            Some(restage) => Some(upload::restage(restage, self.hasher.as_ref())?),
            None => None,
        };
        let now = self.clock.now();
        let result = self.store.write(|txn| {
            upload::begin_upload(txn, file_uuid, task_identifier, now, self.config.upload_expiry, restaged)
        });
        if let (Err(_), Some(restage)) = (&result, &restage) {
            upload::discard_staged(std::slice::from_ref(&restage.path));
        }
        result
    }

    /// Confirms the server finished a deferred update batch.
    ///
    /// # Errors
    ///
    /// Fails if no batch waits for `deferred_upload_id`.
    pub fn confirm_deferred_upload(&self, deferred_upload_id: u64) -> ReplicaResult<()> {
        let consumed = self
            .store
            .write(|txn| upload::confirm_deferred_upload(txn, deferred_upload_id))?;
        upload::discard_staged(&consumed.released);
        Ok(())
    }

    // Transfers

    /// Records a transfer outcome reported by the transport, then hands it to
    /// the owning tracker.
    ///
    /// The outcome is committed before it is consumed, so a crash in between
    /// is repaired by [`Replica::reattach_transfers`].
    ///
    /// # Errors
    ///
    /// Fails if a different outcome is already recorded for the task.
    pub fn complete_transfer(
        &self,
        task_identifier: &str,
        outcome: TransferOutcome,
    ) -> ReplicaResult<TransferCompletion> {
        let entry_id = match self
            .store
            .write(|txn| network_cache::complete(txn, task_identifier, outcome))
        {
            Ok(id) => id,
            Err(ReplicaError::UnknownTransfer(_)) => {
                tracing::debug!(task_identifier, "transfer outcome already consumed");
                return Ok(TransferCompletion::AlreadyConsumed);
            }
            Err(e) => return Err(e),
        };
        let consumed = self.store.write(|txn| recovery::consume_entry(txn, entry_id))?;
        upload::discard_staged(&consumed.released);
        Ok(if consumed.orphan {
            TransferCompletion::Orphaned
        } else {
            TransferCompletion::Consumed
        })
    }

    /// Looks up a ledger entry.
    #[must_use]
    pub fn lookup_transfer(&self, task_identifier: &str) -> Option<NetworkCacheEntry> {
        self.store.read(|t| network_cache::lookup(t, task_identifier))
    }

    /// Replays recorded outcomes and drops unreferenced ledger entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn reattach_transfers(&self) -> ReplicaResult<ReattachReport> {
        let report = self.store.write(recovery::reattach_transfers)?;
        upload::discard_staged(&report.released);
        Ok(report)
    }

    /// Resets every tracker whose expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn sweep_expired(&self) -> ReplicaResult<SweepReport> {
        let now = self.clock.now();
        let threshold = self.config.retry_warning_threshold;
        let report = self.store.write(|txn| recovery::sweep_expired(txn, now, threshold))?;
        upload::discard_staged(&report.released);
        Ok(report)
    }

    /// Deferred upload and deletion ids the server has yet to confirm.
    #[must_use]
    pub fn pending_deferred_ids(&self) -> DeferredIds {
        self.store.read(recovery::pending_deferred_ids)
    }

    // Downloads

    /// Queues files of one file group for download.
    ///
    /// # Errors
    ///
    /// Fails on invalid requests and on files unknown to the directory.
    pub fn queue_download(&self, request: &DownloadRequest) -> ReplicaResult<QueuedDownload> {
        let now = self.clock.now();
        self.store.write(|txn| download::queue(txn, request, now))
    }

    /// Files that may start downloading now.
    #[must_use]
    pub fn next_downloads(&self, limit: usize) -> Vec<PendingDownload> {
        self.store.read(|t| download::next_downloads(t, limit))
    }

    /// Marks a file as handed to the transport under `task_identifier`.
    ///
    /// # Errors
    ///
    /// Fails if the file has no download waiting to start.
    pub fn begin_download(&self, file_uuid: FileUuid, task_identifier: &str) -> ReplicaResult<PendingDownload> {
        let now = self.clock.now();
        self.store.write(|txn| {
            download::begin_download(txn, file_uuid, task_identifier, now, self.config.download_expiry)
        })
    }

    /// Downloaded files the app has not taken yet.
    #[must_use]
    pub fn completed_downloads(&self) -> Vec<CompletedDownload> {
        self.store.read(download::completed_downloads)
    }

    /// Clears a downloaded file's tracker. Returns true if the file group's
    /// tracker went with it.
    ///
    /// # Errors
    ///
    /// Fails if the file has no downloaded tracker.
    pub fn mark_file_downloaded(&self, file_uuid: FileUuid, version: Option<FileVersion>) -> ReplicaResult<bool> {
        self.store
            .write(|txn| download::mark_file_downloaded(txn, file_uuid, version))
    }

    /// Clears every tracker of a downloaded file group.
    ///
    /// # Errors
    ///
    /// Fails if the group has no tracker or a file is not downloaded.
    pub fn mark_object_downloaded(&self, group: FileGroupUuid, record_versions: bool) -> ReplicaResult<usize> {
        self.store
            .write(|txn| download::mark_object_downloaded(txn, group, record_versions))
    }

    // Deletions

    /// Queues a deletion.
    ///
    /// # Errors
    ///
    /// Fails for unknown or fully deleted targets.
    pub fn queue_deletion(&self, target: DeletionTarget) -> ReplicaResult<DeletionQueued> {
        self.store.write(|txn| deletion::queue(txn, target))
    }

    /// Deletions that may be sent now.
    #[must_use]
    pub fn next_deletions(&self, limit: usize) -> Vec<PendingDeletion> {
        self.store.read(|t| deletion::next_deletions(t, limit))
    }

    /// Marks a deletion request as sent.
    ///
    /// # Errors
    ///
    /// Fails if the deletion is not waiting to be sent.
    pub fn begin_deletion(&self, target: DeletionTarget) -> ReplicaResult<()> {
        let now = self.clock.now();
        self.store
            .write(|txn| deletion::begin_deletion(txn, target, now, self.config.deletion_expiry))
    }

    /// Applies the server's answer to a sent deletion. Returns true once the
    /// deletion is done.
    ///
    /// # Errors
    ///
    /// Fails if the deletion was not sent.
    pub fn deletion_accepted(&self, target: DeletionTarget, accepted: DeletionAccepted) -> ReplicaResult<bool> {
        self.store
            .write(|txn| deletion::deletion_accepted(txn, target, accepted))
    }

    /// Confirms the server finished a deferred deletion.
    ///
    /// # Errors
    ///
    /// Fails if no deletion waits for `deferred_upload_id`.
    pub fn confirm_deferred_deletion(&self, deferred_upload_id: u64) -> ReplicaResult<DeletionTarget> {
        self.store
            .write(|txn| deletion::confirm_deferred_deletion(txn, deferred_upload_id))
    }

    // Directory and index

    /// Applies a server file index for one sharing group.
    ///
    /// # Errors
    ///
    /// Fails, writing nothing, on any invalid or conflicting row.
    pub fn upsert(&self, index: &[ServerFileInfo], sharing_group: SharingGroupUuid) -> ReplicaResult<ReconcileReport> {
        self.store
            .write(|txn| reconciler::upsert(txn, index, sharing_group, self.resolver.as_ref()))
    }

    /// File groups of a sharing group with files to download.
    #[must_use]
    pub fn objects_needing_download(&self, sharing_group: SharingGroupUuid, include_gone: bool) -> Vec<ObjectDownloadNeed> {
        self.store
            .read(|t| directory::objects_needing_download(t, sharing_group, include_gone))
    }

    /// Files of one file group to download, if any.
    ///
    /// # Errors
    ///
    /// Fails if the file group is unknown.
    pub fn object_needs_download(
        &self,
        group: FileGroupUuid,
        include_gone: bool,
    ) -> ReplicaResult<Option<ObjectDownloadNeed>> {
        self.store
            .read(|t| directory::object_needs_download(t, group, include_gone))
    }

    /// File groups deleted on the server but still present on this device.
    #[must_use]
    pub fn objects_needing_local_deletion(&self) -> Vec<ObjectEntry> {
        self.store.read(directory::objects_needing_local_deletion)
    }

    /// Records that the app removed a server-deleted file group.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown or still live on the server.
    pub fn mark_as_deleted_locally(&self, group: FileGroupUuid) -> ReplicaResult<bool> {
        self.store
            .write(|txn| directory::mark_as_deleted_locally(txn, group))
    }

    /// Directory entry of a file group.
    #[must_use]
    pub fn object_entry(&self, group: FileGroupUuid) -> Option<ObjectEntry> {
        self.store.read(|t| directory::object_entry(t, group))
    }

    /// Directory entry of a file.
    #[must_use]
    pub fn file_entry(&self, file_uuid: FileUuid) -> Option<FileEntry> {
        self.store.read(|t| directory::file_entry(t, file_uuid))
    }

    /// Directory entries of a file group's files.
    #[must_use]
    pub fn file_entries(&self, group: FileGroupUuid) -> Vec<FileEntry> {
        self.store.read(|t| directory::file_entries(t, group))
    }

    // Maintenance

    /// Runs pending schema migrations.
    ///
    /// # Errors
    ///
    /// Fails if the store is newer than this release or a migration fails.
    pub fn run_migrations(&self) -> ReplicaResult<MigrationReport> {
        Ok(self.store.run_migrations(&replica_migrations()?)?)
    }

    /// Writes a snapshot and truncates the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be saved.
    pub fn checkpoint(&self) -> ReplicaResult<()> {
        Ok(self.store.checkpoint()?)
    }

    /// Store statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal length cannot be read.
    pub fn stats(&self) -> ReplicaResult<StoreStats> {
        Ok(self.store.stats()?)
    }

    /// Checks references between tables.
    #[must_use]
    pub fn verify(&self) -> VerifyReport {
        self.store.read(verify::verify)
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("sequence", &self.store.sequence())
            .field("schema_version", &self.store.schema_version())
            .field("staging_dir", &self.staging_dir)
            .field("hasher", &self.hasher.name())
            .finish_non_exhaustive()
    }
}
