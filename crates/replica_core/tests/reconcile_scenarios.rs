//! Index reconciliation scenarios.

use proptest::prelude::*;
use replica_core::{
    FileGroupUuid, FileState, FileUuid, MimeType, Replica, ReplicaError, SharingGroupUuid,
};
use replica_testkit::prelude::*;

#[test]
fn new_file_deleted_on_server_is_recorded_as_fully_deleted() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    let mut info = server_file(file, group, sharing, FILE1, 2);
    info.deleted = true;

    let report = fixture.upsert(&[info], sharing).unwrap();
    assert_eq!((report.objects_created, report.files_created), (1, 1));

    let object = fixture.object_entry(group).unwrap();
    assert!(object.deleted_locally && object.deleted_on_server);
    let entry = fixture.file_entry(file).unwrap();
    assert!(entry.deleted_locally && entry.deleted_on_server);
    assert_eq!(entry.server_file_version, Some(2));
    assert!(fixture.objects_needing_local_deletion().is_empty());
    assert!(fixture.objects_needing_download(sharing, true).is_empty());
}

#[test]
fn newer_server_version_needs_download() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();

    fixture.upsert(&[server_file(file, group, sharing, FILE1, 0)], sharing).unwrap();
    assert_eq!(fixture.file_entry(file).unwrap().state(), FileState::NeedsDownload);

    let need = fixture.object_needs_download(group, false).unwrap().unwrap();
    assert_eq!(need.files.len(), 1);
    assert_eq!(need.files[0].file_label, FILE1);
}

#[test]
fn conflicting_row_rolls_back_the_whole_index() {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    fixture.upsert(&[server_file(file, group, sharing, FILE1, 0)], sharing).unwrap();
    let before = fixture.stats().unwrap().sequence;

    let fresh = server_file(FileUuid::random(), FileGroupUuid::random(), sharing, FILE1, 0);
    let mut conflicting = server_file(file, group, sharing, FILE1, 1);
    conflicting.mime_type = MimeType::new("image/png");

    let err = fixture.upsert(&[fresh.clone(), conflicting], sharing).unwrap_err();
    assert!(matches!(err, ReplicaError::NotMatching { .. }));
    assert!(err.is_integrity());
    assert_eq!(fixture.stats().unwrap().sequence, before);
    assert!(fixture.file_entry(fresh.file_uuid).is_none());
    assert_eq!(fixture.file_entry(file).unwrap().server_file_version, Some(0));
}

#[test]
fn index_rows_are_checked_before_writing() {
    let fixture = TestReplica::in_memory();
    let sharing = SharingGroupUuid::random();
    let info = server_file(FileUuid::random(), FileGroupUuid::random(), sharing, FILE1, 0);

    let err = fixture.upsert(&[info.clone(), info.clone()], sharing).unwrap_err();
    assert!(matches!(err, ReplicaError::DuplicateFileUUIDInIndex(f) if f == info.file_uuid));

    let err = fixture.upsert(&[info.clone()], SharingGroupUuid::random()).unwrap_err();
    assert!(matches!(err, ReplicaError::SharingGroupMismatch { .. }));

    let mut untyped = info;
    untyped.object_type = None;
    let err = fixture.upsert(&[untyped], sharing).unwrap_err();
    assert!(matches!(err, ReplicaError::MissingObjectType(_)));
    assert!(fixture.read(|t| t.directory_files.is_empty()));
}

#[test]
fn resolver_fills_in_missing_type_and_label() {
    let fixture = TestReplica::in_memory().with_resolver(
        MapLabelResolver::new()
            .with_object_type("kind=foo;part=3", FOO)
            .with_file_label(FOO, "kind=foo;part=3", "file3"),
    );
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    let mut info = server_file(file, group, sharing, FILE1, 0);
    info.object_type = None;
    info.file_label = None;
    info.app_meta_data = Some("kind=foo;part=3".into());

    let report = fixture.upsert(&[info], sharing).unwrap();
    assert_eq!(report.declared_labels, vec![(FOO.to_string(), "file3".to_string())]);
    assert_eq!(fixture.object_entry(group).unwrap().object_type, FOO);
    assert_eq!(fixture.file_entry(file).unwrap().file_label, "file3");
    assert!(fixture.declared_object(FOO).unwrap().file("file3").is_some());

    let fixture = fixture.relaunch();
    assert!(fixture.declared_object(FOO).unwrap().file("file3").is_some());
}

#[test]
fn underivable_label_fails_the_whole_index() {
    let fixture = TestReplica::in_memory()
        .with_resolver(MapLabelResolver::new().with_object_type("kind=foo;part=9", FOO));
    fixture.register_foo();
    let sharing = SharingGroupUuid::random();
    let before = fixture.stats().unwrap().sequence;

    let fresh = server_file(FileUuid::random(), FileGroupUuid::random(), sharing, FILE1, 0);
    let mut unlabelled = server_file(FileUuid::random(), FileGroupUuid::random(), sharing, FILE1, 0);
    unlabelled.file_label = None;
    unlabelled.app_meta_data = Some("kind=foo;part=9".into());

    let err = fixture.upsert(&[fresh.clone(), unlabelled.clone()], sharing).unwrap_err();
    assert!(matches!(err, ReplicaError::MissingFileLabel(f) if f == unlabelled.file_uuid));
    assert_eq!(fixture.stats().unwrap().sequence, before);
    assert!(fixture.file_entry(fresh.file_uuid).is_none());
    assert_eq!(fixture.declared_object(FOO).unwrap().files.len(), 2);

    unlabelled.app_meta_data = None;
    let err = fixture.upsert(&[unlabelled], sharing).unwrap_err();
    assert!(matches!(err, ReplicaError::MissingFileLabel(_)));
}

fn sequence(replica: &Replica) -> u64 {
    replica.stats().unwrap().sequence
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reapplying_an_index_writes_nothing(index in server_index_strategy(SharingGroupUuid(uuid::Uuid::nil()))) {
        let sharing = SharingGroupUuid(uuid::Uuid::nil());
        let replica = Replica::open_in_memory().unwrap();

        let first = replica.upsert(&index, sharing).unwrap();
        prop_assert_eq!(first.files_created, index.len());
        let after_first = sequence(&replica);

        let second = replica.upsert(&index, sharing).unwrap();
        prop_assert!(second.is_unchanged());
        prop_assert_eq!(sequence(&replica), after_first);
        prop_assert!(replica.verify().is_clean());
    }
}
