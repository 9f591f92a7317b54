//! Relaunch, expiry and torn-journal scenarios.

use replica_core::{
    DeletionAccepted, DeletionTarget, DownloadBody, DownloadFile, DownloadRequest, FileGroupUuid, FileUuid,
    ReplicaConfig, SharingGroupUuid, StoredSource, TransferCompletion, TransferOutcome, UploadBody, UploadStatus,
};
use replica_testkit::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn recorded_outcome_is_replayed_once_after_a_crash() {
    let (fixture, switch) = TestReplica::in_memory_faulty(ReplicaConfig::new());
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let file = FileUuid::random();
    fixture
        .queue_upload(&foo_upload(group, SharingGroupUuid::random(), &[(file, FILE1)]))
        .unwrap();
    let pending = fixture.begin_upload(file, "task-1").unwrap();

    switch.crash_on_append(2);
    let outcome = TransferOutcome::Upload(UploadBody::V0BatchComplete);
    assert!(fixture.complete_transfer("task-1", outcome.clone()).is_err());
    assert!(switch.has_crashed());

    let fixture = fixture.relaunch();
    assert!(fixture.lookup_transfer("task-1").is_none());
    assert_eq!(fixture.file_entry(file).unwrap().file_version, Some(0));
    fixture.read(|t| {
        assert!(t.upload_objects.is_empty());
        assert!(t.upload_files.is_empty());
    });
    assert!(!pending.content.exists());

    assert_eq!(
        fixture.complete_transfer("task-1", outcome).unwrap(),
        TransferCompletion::AlreadyConsumed
    );
    let report = fixture.reattach_transfers().unwrap();
    assert_eq!((report.replayed, report.orphans), (0, 0));
    assert!(fixture.verify().is_clean());
}

#[test]
fn transfer_started_before_relaunch_completes_after_it() {
    let fixture = TestReplica::on_disk();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    fixture
        .upsert(&[server_file(file, group, sharing, FILE1, 1)], sharing)
        .unwrap();
    fixture
        .queue_download(&DownloadRequest::new(
            group,
            vec![DownloadFile {
                file_uuid: file,
                file_version: 1,
            }],
        ))
        .unwrap();
    fixture.begin_download(file, "bg-7").unwrap();

    let fixture = fixture.relaunch();
    let entry = fixture.lookup_transfer("bg-7").unwrap();
    assert_eq!(entry.file_uuid, file);
    assert!(!entry.transfer.is_complete());

    let completion = fixture
        .complete_transfer(
            "bg-7",
            TransferOutcome::Download(DownloadBody::Downloaded {
                location: PathBuf::from("/tmp/bg-7"),
                checksum: None,
            }),
        )
        .unwrap();
    assert_eq!(completion, TransferCompletion::Consumed);
    assert_eq!(fixture.completed_downloads().len(), 1);
}

#[test]
fn on_disk_upload_survives_relaunch_with_its_staged_copy() {
    let fixture = TestReplica::on_disk();
    fixture.register_foo();
    let file = FileUuid::random();
    fixture
        .queue_upload(&foo_upload(FileGroupUuid::random(), SharingGroupUuid::random(), &[(file, FILE1)]))
        .unwrap();
    let staging = fixture.staging_dir().unwrap().to_path_buf();
    assert!(staging.starts_with(fixture.replica_path().unwrap()));

    let fixture = fixture.relaunch();
    let next = fixture.next_uploads(10);
    assert_eq!(next.len(), 1);
    assert!(next[0].content.exists());
    assert!(next[0].content.starts_with(&staging));
}

#[test]
fn expired_transfers_are_reset_with_a_retry_count() {
    let config = ReplicaConfig::new()
        .upload_expiry(Duration::from_secs(60))
        .deletion_expiry(Duration::from_secs(30));
    let fixture = TestReplica::in_memory_with_config(config);
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let file = FileUuid::random();
    fixture
        .queue_upload(&foo_upload(group, SharingGroupUuid::random(), &[(file, FILE1)]))
        .unwrap();
    let pending = fixture.begin_upload(file, "slow").unwrap();

    fixture.clock().advance(Duration::from_secs(59));
    assert!(fixture.sweep_expired().unwrap().is_empty());

    fixture.clock().advance(Duration::from_secs(2));
    let report = fixture.sweep_expired().unwrap();
    assert_eq!(report.uploads.len(), 1);
    assert_eq!(report.uploads[0].number_retries, 1);
    assert!(fixture.lookup_transfer("slow").is_none());
    fixture.read(|t| {
        let (_, tracker) = t.upload_files.iter().next().unwrap();
        assert_eq!(tracker.status, UploadStatus::NotStarted);
    });

    assert!(!pending.content.exists());
    fixture.read(|t| {
        let (_, tracker) = t.upload_files.iter().next().unwrap();
        assert_eq!(tracker.source, StoredSource::Released(pending.content.clone()));
    });

    let retry = fixture.next_uploads(10);
    assert_eq!(retry[0].number_retries, 1);
    assert_eq!(retry[0].content, pending.content);

    assert_eq!(
        fixture
            .complete_transfer("slow", TransferOutcome::Upload(UploadBody::V0BatchComplete))
            .unwrap(),
        TransferCompletion::AlreadyConsumed
    );
    let restarted = fixture.begin_upload(file, "retry").unwrap();
    assert!(restarted.content.exists());
    assert_eq!(restarted.check_sum, pending.check_sum);
    assert_eq!(
        fixture
            .complete_transfer("retry", TransferOutcome::Upload(UploadBody::V0BatchComplete))
            .unwrap(),
        TransferCompletion::Consumed
    );

    let target = DeletionTarget::Object(group);
    fixture.queue_deletion(target).unwrap();
    fixture.begin_deletion(target).unwrap();
    fixture.clock().advance(Duration::from_secs(31));
    let report = fixture.sweep_expired().unwrap();
    assert_eq!(report.deletions.len(), 1);
    assert_eq!(fixture.next_deletions(10)[0].number_retries, 1);
    assert!(fixture.deletion_accepted(target, DeletionAccepted::Completed).is_err());
}

#[test]
fn released_copy_is_restaged_after_relaunch() {
    let fixture = TestReplica::on_disk_with_config(ReplicaConfig::new().upload_expiry(Duration::from_secs(5)));
    fixture.register_foo();
    let file = FileUuid::random();
    fixture
        .queue_upload(&foo_upload(FileGroupUuid::random(), SharingGroupUuid::random(), &[(file, FILE1)]))
        .unwrap();
    let first = fixture.begin_upload(file, "first").unwrap();
    fixture.clock().advance(Duration::from_secs(6));
    assert_eq!(fixture.sweep_expired().unwrap().uploads.len(), 1);
    assert!(!first.content.exists());

    let fixture = fixture.relaunch();
    let second = fixture.begin_upload(file, "second").unwrap();
    assert_eq!(second.content, first.content);
    assert_eq!(std::fs::read(&second.content).unwrap(), b"content of file1");
    assert_eq!(
        fixture
            .complete_transfer("second", TransferOutcome::Upload(UploadBody::V0BatchComplete))
            .unwrap(),
        TransferCompletion::Consumed
    );
    assert!(!second.content.exists());
    assert_eq!(fixture.file_entry(file).unwrap().file_version, Some(0));
}

#[test]
fn torn_journal_write_recovers_last_commit() {
    let (fixture, switch) = TestReplica::in_memory_faulty(ReplicaConfig::new());
    fixture.register_foo();
    let committed = fixture.stats().unwrap().sequence;
    let journal = fixture.journal_bytes().unwrap().len();

    switch.crash_after(16);
    let file = FileUuid::random();
    assert!(fixture
        .queue_upload(&foo_upload(FileGroupUuid::random(), SharingGroupUuid::random(), &[(file, FILE1)]))
        .is_err());
    assert!(fixture.next_uploads(10).is_empty());
    assert_eq!(fixture.journal_bytes().unwrap().len(), journal + 16);

    let fixture = fixture.relaunch();
    assert_eq!(fixture.journal_bytes().unwrap().len(), journal);
    assert_eq!(fixture.stats().unwrap().sequence, committed);
    assert!(fixture.declared_object(FOO).is_some());
    assert!(fixture.file_entry(file).is_none());
    assert!(fixture.verify().is_clean());

    fixture
        .queue_upload(&foo_upload(FileGroupUuid::random(), SharingGroupUuid::random(), &[(file, FILE1)]))
        .unwrap();
    assert_eq!(fixture.next_uploads(10).len(), 1);
}

#[test]
fn checkpoint_then_relaunch_keeps_state() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    fixture
        .upsert(&[server_file(FileUuid::random(), group, sharing, FILE1, 4)], sharing)
        .unwrap();
    fixture.checkpoint().unwrap();
    assert_eq!(fixture.stats().unwrap().journal_bytes, 0);

    let fixture = fixture.relaunch();
    assert!(fixture.object_entry(group).is_some());
    assert_eq!(fixture.objects_needing_download(sharing, false).len(), 1);
}
