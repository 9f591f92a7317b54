//! Upload queue scenarios across the replica facade.

use replica_core::{
    FileGroupUuid, FileUuid, ReplicaError, SharingGroupUuid, TransferCompletion, TransferOutcome, UploadBody,
    VersionClass,
};
use replica_testkit::prelude::*;
use std::fs;
use std::path::Path;

fn staged_files(dir: Option<&Path>) -> usize {
    dir.and_then(|d| fs::read_dir(d).ok()).map_or(0, |entries| entries.count())
}

fn upload_once(fixture: &TestReplica, group: FileGroupUuid, sharing: SharingGroupUuid, file: FileUuid, label: &str) {
    fixture.queue_upload(&foo_upload(group, sharing, &[(file, label)])).unwrap();
    let task = format!("upload-{file}");
    fixture.begin_upload(file, &task).unwrap();
    let completion = fixture
        .complete_transfer(&task, TransferOutcome::Upload(UploadBody::V0BatchComplete))
        .unwrap();
    assert_eq!(completion, TransferCompletion::Consumed);
}

#[test]
fn first_upload_creates_directory_entries_and_cleans_up() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();

    let queued = fixture.queue_upload(&foo_upload(group, sharing, &[(file, FILE1)])).unwrap();
    assert_eq!(queued.version_class, VersionClass::V0);
    assert!(!queued.waiting);
    assert!(fixture.object_entry(group).is_some());

    let pending = fixture.begin_upload(file, "task-1").unwrap();
    assert_eq!(pending.file_version, 0);
    assert_eq!((pending.upload_index, pending.upload_count), (1, 1));
    assert!(pending.content.exists());

    let completion = fixture
        .complete_transfer("task-1", TransferOutcome::Upload(UploadBody::V0BatchComplete))
        .unwrap();
    assert_eq!(completion, TransferCompletion::Consumed);

    let entry = fixture.file_entry(file).unwrap();
    assert_eq!(entry.file_version, Some(0));
    assert_eq!(entry.server_file_version, None);
    assert_eq!(entry.file_label, FILE1);
    fixture.read(|t| {
        assert_eq!(t.directory_objects.len(), 1);
        assert_eq!(t.directory_files.len(), 1);
        assert!(t.upload_objects.is_empty());
        assert!(t.upload_files.is_empty());
        assert!(t.network_cache.is_empty());
    });
    assert!(!pending.content.exists());
    assert!(fixture.verify().is_clean());
}

#[test]
fn mixed_first_and_update_batch_writes_nothing() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let updated = FileUuid::random();
    upload_once(&fixture, group, sharing, updated, FILE2);

    let before = fixture.stats().unwrap().sequence;
    let staged_before = staged_files(fixture.staging_dir());
    let err = fixture
        .queue_upload(&foo_upload(group, sharing, &[(updated, FILE2), (FileUuid::random(), FILE1)]))
        .unwrap_err();

    assert!(matches!(err, ReplicaError::SomeUploadFilesV0SomeVN(g) if g == group));
    assert!(err.is_validation());
    assert_eq!(fixture.stats().unwrap().sequence, before);
    assert_eq!(staged_files(fixture.staging_dir()), staged_before);
    fixture.read(|t| assert!(t.upload_objects.is_empty()));
}

#[test]
fn duplicate_file_uuids_are_rejected_wholesale() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let file = FileUuid::random();
    let before = fixture.stats().unwrap().sequence;

    let err = fixture
        .queue_upload(&foo_upload(
            FileGroupUuid::random(),
            SharingGroupUuid::random(),
            &[(file, FILE1), (file, FILE2)],
        ))
        .unwrap_err();

    assert!(matches!(err, ReplicaError::UploadsDoNotHaveDistinctUUIDs));
    assert_eq!(fixture.stats().unwrap().sequence, before);
    assert!(fixture.next_uploads(10).is_empty());
}

#[test]
fn second_batch_for_a_group_waits_for_the_first() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let first = FileUuid::random();
    let second = FileUuid::random();

    assert!(!fixture.queue_upload(&foo_upload(group, sharing, &[(first, FILE1)])).unwrap().waiting);
    assert!(fixture.queue_upload(&foo_upload(group, sharing, &[(second, FILE2)])).unwrap().waiting);

    let next: Vec<FileUuid> = fixture.next_uploads(10).iter().map(|p| p.file_uuid).collect();
    assert_eq!(next, vec![first]);
    assert!(matches!(
        fixture.begin_upload(second, "early").unwrap_err(),
        ReplicaError::InvalidTransition { .. }
    ));

    fixture.begin_upload(first, "t1").unwrap();
    fixture
        .complete_transfer("t1", TransferOutcome::Upload(UploadBody::V0BatchComplete))
        .unwrap();

    let next: Vec<FileUuid> = fixture.next_uploads(10).iter().map(|p| p.file_uuid).collect();
    assert_eq!(next, vec![second]);
    fixture.begin_upload(second, "t2").unwrap();
}

#[test]
fn update_batch_finishes_on_deferred_confirmation() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    upload_once(&fixture, group, sharing, file, FILE2);

    let queued = fixture.queue_upload(&foo_upload(group, sharing, &[(file, FILE2)])).unwrap();
    assert_eq!(queued.version_class, VersionClass::VN);
    let pending = fixture.begin_upload(file, "update").unwrap();
    assert_eq!(pending.file_version, 1);
    assert_eq!(pending.change_resolver_name.as_deref(), Some(COMMENT_RESOLVER));

    fixture
        .complete_transfer(
            "update",
            TransferOutcome::Upload(UploadBody::VNBatchDeferred { deferred_upload_id: 42 }),
        )
        .unwrap();
    assert_eq!(fixture.pending_deferred_ids().uploads, vec![42]);
    assert_eq!(fixture.file_entry(file).unwrap().file_version, Some(0));

    fixture.confirm_deferred_upload(42).unwrap();
    assert_eq!(fixture.file_entry(file).unwrap().file_version, Some(1));
    assert!(fixture.pending_deferred_ids().uploads.is_empty());
    fixture.read(|t| assert!(t.upload_objects.is_empty()));
    assert!(!pending.content.exists());

    assert!(matches!(
        fixture.confirm_deferred_upload(42).unwrap_err(),
        ReplicaError::UnknownTracker(_)
    ));
}

#[test]
fn update_of_a_file_without_resolver_is_rejected() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    upload_once(&fixture, group, sharing, file, FILE1);

    let err = fixture.queue_upload(&foo_upload(group, sharing, &[(file, FILE1)])).unwrap_err();
    assert!(matches!(err, ReplicaError::NoChangeResolver { .. }));
}

#[test]
fn repeated_completion_is_a_no_op() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let file = FileUuid::random();
    fixture
        .queue_upload(&foo_upload(FileGroupUuid::random(), SharingGroupUuid::random(), &[(file, FILE1)]))
        .unwrap();
    fixture.begin_upload(file, "once").unwrap();

    let outcome = TransferOutcome::Upload(UploadBody::V0BatchComplete);
    assert_eq!(
        fixture.complete_transfer("once", outcome.clone()).unwrap(),
        TransferCompletion::Consumed
    );
    let sequence = fixture.stats().unwrap().sequence;
    assert_eq!(
        fixture.complete_transfer("once", outcome).unwrap(),
        TransferCompletion::AlreadyConsumed
    );
    assert_eq!(fixture.stats().unwrap().sequence, sequence);
}
