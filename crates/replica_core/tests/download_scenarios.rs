//! Download queue scenarios: index, queue, transfer, take.

use replica_core::{
    DownloadBody, DownloadFile, DownloadRequest, FileGroupUuid, FileUuid, GoneReason, ReplicaError,
    SharingGroupUuid, TransferCompletion, TransferOutcome,
};
use replica_testkit::prelude::*;
use std::path::PathBuf;

struct Indexed {
    fixture: TestReplica,
    group: FileGroupUuid,
    sharing: SharingGroupUuid,
    file: FileUuid,
}

fn indexed_file(version: u32) -> Indexed {
    let fixture = TestReplica::in_memory();
    fixture.register_foo();
    let group = FileGroupUuid::random();
    let sharing = SharingGroupUuid::random();
    let file = FileUuid::random();
    fixture
        .upsert(&[server_file(file, group, sharing, FILE1, version)], sharing)
        .unwrap();
    Indexed {
        fixture,
        group,
        sharing,
        file,
    }
}

#[test]
fn queuing_the_same_group_twice_keeps_one_tracker_pair() {
    let Indexed {
        fixture, group, file, ..
    } = indexed_file(0);
    let request = DownloadRequest::new(
        group,
        vec![DownloadFile {
            file_uuid: file,
            file_version: 0,
        }],
    );

    let first = fixture.queue_download(&request).unwrap();
    let second = fixture.queue_download(&request).unwrap();
    assert!(first.created);
    assert_eq!(first.added, 1);
    assert!(!second.created);
    assert_eq!(second.added, 0);
    assert_eq!(first.tracker_id, second.tracker_id);

    fixture.read(|t| {
        assert_eq!(t.download_objects.len(), 1);
        assert_eq!(t.download_files.len(), 1);
    });
}

#[test]
fn indexed_file_downloads_and_records_its_version() {
    let Indexed {
        fixture,
        group,
        sharing,
        file,
    } = indexed_file(3);

    let needs = fixture.objects_needing_download(sharing, false);
    assert_eq!(needs.len(), 1);
    assert_eq!(needs[0].files[0].file_version, Some(3));

    fixture
        .queue_download(&DownloadRequest::new(
            group,
            vec![DownloadFile {
                file_uuid: file,
                file_version: 3,
            }],
        ))
        .unwrap();
    assert!(fixture.objects_needing_download(sharing, false).is_empty());

    let pending = fixture.begin_download(file, "dl-1").unwrap();
    assert_eq!(pending.file_version, 3);
    assert_eq!(pending.file_label, FILE1);

    let location = PathBuf::from("/downloads/dl-1");
    let completion = fixture
        .complete_transfer(
            "dl-1",
            TransferOutcome::Download(DownloadBody::Downloaded {
                location: location.clone(),
                checksum: Some("abc".into()),
            }),
        )
        .unwrap();
    assert_eq!(completion, TransferCompletion::Consumed);

    let completed = fixture.completed_downloads();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].local_url.as_ref(), Some(&location));
    assert_eq!(completed[0].check_sum.as_deref(), Some("abc"));
    assert_eq!(fixture.file_entry(file).unwrap().file_version, None);

    assert_eq!(fixture.mark_object_downloaded(group, true).unwrap(), 1);
    assert_eq!(fixture.file_entry(file).unwrap().file_version, Some(3));
    fixture.read(|t| {
        assert!(t.download_objects.is_empty());
        assert!(t.download_files.is_empty());
        assert!(t.network_cache.is_empty());
    });
    assert!(fixture.objects_needing_download(sharing, false).is_empty());
}

#[test]
fn gone_files_surface_only_on_request() {
    let Indexed {
        fixture,
        group,
        sharing,
        file,
    } = indexed_file(0);
    fixture
        .queue_download(&DownloadRequest::new(
            group,
            vec![DownloadFile {
                file_uuid: file,
                file_version: 0,
            }],
        ))
        .unwrap();
    fixture.begin_download(file, "dl-gone").unwrap();
    fixture
        .complete_transfer(
            "dl-gone",
            TransferOutcome::Download(DownloadBody::Gone(GoneReason::FileRemovedOrRenamed)),
        )
        .unwrap();

    let completed = fixture.completed_downloads();
    assert_eq!(completed[0].gone_reason, Some(GoneReason::FileRemovedOrRenamed));
    assert!(fixture.mark_file_downloaded(file, None).unwrap());
    assert_eq!(
        fixture.file_entry(file).unwrap().gone_reason,
        Some(GoneReason::FileRemovedOrRenamed)
    );

    assert!(fixture.objects_needing_download(sharing, false).is_empty());
    let with_gone = fixture.objects_needing_download(sharing, true);
    assert_eq!(with_gone.len(), 1);
    assert_eq!(with_gone[0].files[0].gone_reason, Some(GoneReason::FileRemovedOrRenamed));
}

#[test]
fn download_requests_are_validated_before_writing() {
    let Indexed {
        fixture, group, file, ..
    } = indexed_file(0);
    let before = fixture.stats().unwrap().sequence;
    let dup = DownloadFile {
        file_uuid: file,
        file_version: 0,
    };

    let err = fixture
        .queue_download(&DownloadRequest::new(group, vec![dup, dup]))
        .unwrap_err();
    assert!(matches!(err, ReplicaError::DownloadsDoNotHaveDistinctUUIDs));

    let err = fixture
        .queue_download(&DownloadRequest::new(group, Vec::new()))
        .unwrap_err();
    assert!(matches!(err, ReplicaError::EmptyRequest));

    let err = fixture
        .queue_download(&DownloadRequest::new(
            group,
            vec![DownloadFile {
                file_uuid: FileUuid::random(),
                file_version: 0,
            }],
        ))
        .unwrap_err();
    assert!(matches!(err, ReplicaError::NoObject(_)));
    assert_eq!(fixture.stats().unwrap().sequence, before);
}

#[test]
fn deleted_groups_cannot_be_downloaded() {
    let Indexed {
        fixture,
        group,
        sharing,
        file,
    } = indexed_file(1);
    let mut deleted = server_file(file, group, sharing, FILE1, 1);
    deleted.deleted = true;
    fixture.upsert(&[deleted], sharing).unwrap();
    let before = fixture.stats().unwrap().sequence;

    let err = fixture
        .queue_download(&DownloadRequest::new(
            group,
            vec![DownloadFile {
                file_uuid: file,
                file_version: 1,
            }],
        ))
        .unwrap_err();
    assert!(matches!(err, ReplicaError::AttemptToQueueADeletedFile(_)));
    assert!(err.is_validation());
    assert_eq!(fixture.stats().unwrap().sequence, before);
    fixture.read(|t| {
        assert!(t.download_objects.is_empty());
        assert!(t.download_files.is_empty());
    });
}
