//! Replica fixtures.
//!
//! A [`TestReplica`] owns a temporary directory, a [`ManualClock`] and the
//! media its replica lives on. [`TestReplica::relaunch`] drops the replica
//! and opens a new one over the same media, which is how tests model an app
//! being killed and started again.

use crate::crash::{FaultSwitch, FaultyLog};
use crate::resolver::MapLabelResolver;
use replica_core::{
    CloudStorageType, DeclaredFile, DeclaredObject, FileGroupUuid, FileUuid, FileVersion, ManualClock, MimeType,
    Replica, ReplicaConfig, ServerFileInfo, SharingGroupUuid, Timestamp, UploadFile, UploadSource,
    UploadableObject,
};
use replica_store::{LogDevice, MemoryLog, MemorySnapshot};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Object type registered by [`foo_declaration`].
pub const FOO: &str = "Foo";

/// Label of the upload-once file in [`foo_declaration`].
pub const FILE1: &str = "file1";

/// Label of the updatable file in [`foo_declaration`].
pub const FILE2: &str = "file2";

/// Change resolver named by [`FILE2`].
pub const COMMENT_RESOLVER: &str = "CommentFile";

/// Clock reading every fixture starts at.
pub const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// `Foo` with two plain-text files; only `file2` has a change resolver.
#[must_use]
pub fn foo_declaration() -> DeclaredObject {
    DeclaredObject::new(
        FOO,
        vec![
            DeclaredFile::new(FILE1, [MimeType::new("text/plain")]),
            DeclaredFile::new(FILE2, [MimeType::new("text/plain")]).with_change_resolver(COMMENT_RESOLVER),
        ],
    )
}

/// An upload of `Foo` carrying inline content for each `(file, label)`.
#[must_use]
pub fn foo_upload(group: FileGroupUuid, sharing: SharingGroupUuid, files: &[(FileUuid, &str)]) -> UploadableObject {
    UploadableObject::new(
        group,
        FOO,
        sharing,
        CloudStorageType::Dropbox,
        files
            .iter()
            .map(|(file, label)| {
                UploadFile::new(*file, *label, UploadSource::Data(format!("content of {label}").into_bytes()))
            })
            .collect(),
    )
}

/// A server index row for a `Foo` file.
#[must_use]
pub fn server_file(
    file: FileUuid,
    group: FileGroupUuid,
    sharing: SharingGroupUuid,
    label: &str,
    version: FileVersion,
) -> ServerFileInfo {
    ServerFileInfo {
        file_uuid: file,
        file_group_uuid: group,
        sharing_group_uuid: sharing,
        mime_type: MimeType::new("text/plain"),
        deleted: false,
        file_version: version,
        cloud_storage_type: CloudStorageType::Dropbox,
        object_type: Some(FOO.to_string()),
        file_label: Some(label.to_string()),
        app_meta_data: None,
        creation_date: START,
    }
}

enum Media {
    Disk,
    Memory { log: MemoryLog, snapshot: MemorySnapshot },
}

/// A replica with its temporary directory, clock and media.
///
/// Dereferences to [`Replica`].
pub struct TestReplica {
    replica: Replica,
    clock: Arc<ManualClock>,
    resolver: MapLabelResolver,
    config: ReplicaConfig,
    media: Media,
    temp_dir: TempDir,
}

impl TestReplica {
    /// A replica in a fresh temporary directory.
    #[must_use]
    pub fn on_disk() -> Self {
        Self::on_disk_with_config(ReplicaConfig::new())
    }

    /// A replica in a fresh temporary directory with `config`.
    #[must_use]
    pub fn on_disk_with_config(config: ReplicaConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        Self::launch(config, Media::Disk, temp_dir, None)
    }

    /// A replica on shared in-memory media, staging under a temporary directory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::in_memory_with_config(ReplicaConfig::new())
    }

    /// A replica on shared in-memory media with `config`.
    #[must_use]
    pub fn in_memory_with_config(config: ReplicaConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = with_staging(config, temp_dir.path());
        Self::launch(config, Self::memory_media(), temp_dir, None)
    }

    /// An in-memory replica whose journal can be made to fail mid-write.
    ///
    /// The fault only affects this launch; after [`relaunch`](Self::relaunch)
    /// the journal is healthy again.
    #[must_use]
    pub fn in_memory_faulty(config: ReplicaConfig) -> (Self, FaultSwitch) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = with_staging(config, temp_dir.path());
        let log = MemoryLog::new();
        let (faulty, switch) = FaultyLog::new(log.clone());
        let media = Media::Memory {
            log,
            snapshot: MemorySnapshot::new(),
        };
        (Self::launch(config, media, temp_dir, Some(Box::new(faulty))), switch)
    }

    fn memory_media() -> Media {
        Media::Memory {
            log: MemoryLog::new(),
            snapshot: MemorySnapshot::new(),
        }
    }

    fn launch(config: ReplicaConfig, media: Media, temp_dir: TempDir, log: Option<Box<dyn LogDevice>>) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        Self::reopen(config, media, temp_dir, clock, MapLabelResolver::new(), log)
    }

    fn reopen(
        config: ReplicaConfig,
        media: Media,
        temp_dir: TempDir,
        clock: Arc<ManualClock>,
        resolver: MapLabelResolver,
        log: Option<Box<dyn LogDevice>>,
    ) -> Self {
        let replica = match &media {
            Media::Disk => Replica::open_with_config(temp_dir.path().join("replica"), config.clone()),
            Media::Memory { log: memory, snapshot } => Replica::open_with_media(
                config.clone(),
                log.unwrap_or_else(|| Box::new(memory.clone())),
                Box::new(snapshot.clone()),
            ),
        }
        .expect("Failed to open replica")
        .with_clock(clock.clone())
        .with_label_resolver(resolver.clone());

        Self {
            replica,
            clock,
            resolver,
            config,
            media,
            temp_dir,
        }
    }

    /// Drops the replica and opens a new one over the same media, keeping the
    /// clock and resolver.
    #[must_use]
    pub fn relaunch(self) -> Self {
        let Self {
            replica,
            clock,
            resolver,
            config,
            media,
            temp_dir,
        } = self;
        drop(replica);
        Self::reopen(config, media, temp_dir, clock, resolver, None)
    }

    /// Installs a label resolver, kept across relaunches.
    #[must_use]
    pub fn with_resolver(self, resolver: MapLabelResolver) -> Self {
        let Self {
            replica,
            clock,
            config,
            media,
            temp_dir,
            ..
        } = self;
        Self {
            replica: replica.with_label_resolver(resolver.clone()),
            clock,
            resolver,
            config,
            media,
            temp_dir,
        }
    }

    /// The fixture's clock.
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// The temporary directory backing the fixture.
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The replica directory, for on-disk fixtures.
    #[must_use]
    pub fn replica_path(&self) -> Option<PathBuf> {
        match self.media {
            Media::Disk => Some(self.temp_dir.path().join("replica")),
            Media::Memory { .. } => None,
        }
    }

    /// Raw journal bytes, for in-memory fixtures.
    #[must_use]
    pub fn journal_bytes(&self) -> Option<Vec<u8>> {
        match &self.media {
            Media::Disk => None,
            Media::Memory { log, .. } => Some(log.bytes()),
        }
    }

    /// Returns the replica.
    #[must_use]
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Registers [`foo_declaration`].
    pub fn register_foo(&self) {
        self.replica
            .register(&foo_declaration())
            .expect("Failed to register Foo");
    }
}

fn with_staging(config: ReplicaConfig, root: &Path) -> ReplicaConfig {
    if config.staging_dir.is_some() {
        config
    } else {
        config.staging_dir(root.join("staging"))
    }
}

impl Deref for TestReplica {
    type Target = Replica;

    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_relaunch_keeps_state() {
        let fixture = TestReplica::in_memory();
        fixture.register_foo();
        let fixture = fixture.relaunch();
        assert!(fixture.declared_object(FOO).is_some());
        assert!(fixture.staging_dir().is_some());
    }

    #[test]
    fn on_disk_relaunch_keeps_state() {
        let fixture = TestReplica::on_disk();
        fixture.register_foo();
        assert!(fixture.replica_path().unwrap().exists());
        let fixture = fixture.relaunch();
        assert_eq!(fixture.declared_objects().len(), 1);
    }

    #[test]
    fn clock_survives_relaunch() {
        let fixture = TestReplica::in_memory();
        fixture.clock().advance(std::time::Duration::from_secs(5));
        let fixture = fixture.relaunch();
        assert_eq!(
            replica_core::Clock::now(fixture.clock()),
            START.saturating_add(std::time::Duration::from_secs(5))
        );
    }
}
