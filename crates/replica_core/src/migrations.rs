//! Migrations shipped with the replica schema.
//!
//! | Version | Name | Effect |
//! |---------|------|--------|
//! | 1 | `normalize_mime_types` | lower-cases MIME types in declarations, directory rows and upload trackers |
//! | 2 | `backfill_upload_positions` | numbers upload file trackers written before batches tracked positions |

use crate::schema::{DeclaredFileRow, FileEntry, ReplicaTables, UploadFileTracker};
use crate::types::MimeType;
use replica_store::{Migration, MigrationSet, MigrationVersion, RowId, StoreResult, Txn};
use std::collections::BTreeMap;

struct NormalizeMimeTypes;

impl Migration<ReplicaTables> for NormalizeMimeTypes {
    fn version(&self) -> MigrationVersion {
        1
    }

    fn name(&self) -> &str {
        "normalize_mime_types"
    }

    fn description(&self) -> Option<&str> {
        Some("lower-case stored MIME types")
    }

    fn up(&self, txn: &mut Txn<'_, ReplicaTables>) -> StoreResult<()> {
        let declared: Vec<RowId> = txn
            .tables()
            .declared_files
            .filter(|f| !f.mime_types.iter().all(MimeType::is_normalized))
            .map(|(id, _)| id)
            .collect();
        for id in declared {
            txn.modify::<DeclaredFileRow, _>(id, |f| {
                let mut mime_types: Vec<MimeType> = f.mime_types.iter().map(MimeType::normalized).collect();
                mime_types.sort();
                mime_types.dedup();
                f.mime_types = mime_types;
            })?;
        }

        let files: Vec<RowId> = txn
            .tables()
            .directory_files
            .filter(|f| !f.mime_type.is_normalized())
            .map(|(id, _)| id)
            .collect();
        for id in files {
            txn.modify::<FileEntry, _>(id, |f| f.mime_type = f.mime_type.normalized())?;
        }

        let uploads: Vec<RowId> = txn
            .tables()
            .upload_files
            .filter(|f| !f.mime_type.is_normalized())
            .map(|(id, _)| id)
            .collect();
        for id in uploads {
            txn.modify::<UploadFileTracker, _>(id, |f| f.mime_type = f.mime_type.normalized())?;
        }
        Ok(())
    }
}

struct BackfillUploadPositions;

impl Migration<ReplicaTables> for BackfillUploadPositions {
    fn version(&self) -> MigrationVersion {
        2
    }

    fn name(&self) -> &str {
        "backfill_upload_positions"
    }

    fn description(&self) -> Option<&str> {
        Some("assign 1-based upload index and count within each batch")
    }

    fn up(&self, txn: &mut Txn<'_, ReplicaTables>) -> StoreResult<()> {
        let mut batches: BTreeMap<RowId, Vec<RowId>> = BTreeMap::new();
        for (id, tracker) in txn.tables().upload_files.filter(|t| t.upload_count == 0) {
            batches.entry(tracker.object_id).or_default().push(id);
        }
        for files in batches.values() {
            let count = u32::try_from(files.len()).unwrap_or(u32::MAX);
            for (index, id) in files.iter().enumerate() {
                let position = u32::try_from(index + 1).unwrap_or(u32::MAX);
                txn.modify::<UploadFileTracker, _>(*id, |t| {
                    t.upload_index = position;
                    t.upload_count = count;
                })?;
            }
        }
        Ok(())
    }
}

/// Every migration of the replica schema.
///
/// # Errors
///
/// Infallible for the shipped set; registration only fails on a repeated
/// version.
pub fn replica_migrations() -> StoreResult<MigrationSet<ReplicaTables>> {
    MigrationSet::new()
        .with(NormalizeMimeTypes)?
        .with(BackfillUploadPositions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectEntry, StoredSource, UploadObjectTracker, UploadStatus, VersionClass};
    use crate::types::{BatchUuid, CloudStorageType, FileGroupUuid, FileUuid, SharingGroupUuid, Timestamp};
    use replica_store::Store;
    use std::path::PathBuf;

    fn legacy_tracker(object_id: RowId, mime: &str) -> UploadFileTracker {
        UploadFileTracker {
            object_id,
            file_uuid: FileUuid::random(),
            file_label: "file1".into(),
            mime_type: serde_mime(mime),
            status: UploadStatus::NotStarted,
            number_retries: 0,
            file_version: None,
            source: StoredSource::Reference(PathBuf::from("/data/a")),
            origin: None,
            check_sum: "x".into(),
            app_meta_data: None,
            change_resolver_name: None,
            upload_index: 0,
            upload_count: 0,
            expiry: None,
            network_cache_id: None,
        }
    }

    /// A MIME type as an older release stored it, without normalization.
    fn serde_mime(raw: &str) -> MimeType {
        replica_store::from_cbor(&replica_store::to_cbor(&raw.to_string()).unwrap()).unwrap()
    }

    #[test]
    fn shipped_set_is_contiguous() {
        let set = replica_migrations().unwrap();
        assert!(set.validate().is_ok());
        assert_eq!(set.latest_version(), 2);
    }

    #[test]
    fn legacy_rows_are_rewritten() {
        let store: Store<ReplicaTables> = Store::open_in_memory().unwrap();
        let group = FileGroupUuid::random();
        let (a, b) = store
            .write(|txn| {
                txn.insert(ObjectEntry {
                    file_group_uuid: group,
                    object_type: "Foo".into(),
                    sharing_group_uuid: SharingGroupUuid::random(),
                    cloud_storage_type: CloudStorageType::Dropbox,
                    deleted_locally: false,
                    deleted_on_server: false,
                })?;
                let object_id = txn.insert(UploadObjectTracker {
                    file_group_uuid: group,
                    batch_uuid: BatchUuid::random(),
                    batch_expiry_interval_ms: 1000,
                    version_class: VersionClass::V0,
                    v0_upload: None,
                    deferred_upload_id: None,
                    push_notification_message: None,
                    object_type: "Foo".into(),
                    sharing_group_uuid: SharingGroupUuid::random(),
                    cloud_storage_type: CloudStorageType::Dropbox,
                    started: false,
                    queued_at: Timestamp::from_millis(0),
                })?;
                let a = txn.insert(legacy_tracker(object_id, "Text/Plain"))?;
                let b = txn.insert(legacy_tracker(object_id, "text/plain"))?;
                Ok::<_, replica_store::StoreError>((a, b))
            })
            .unwrap();

        let report = store.run_migrations(&replica_migrations().unwrap()).unwrap();
        assert_eq!(report.final_version, 2);
        assert_eq!(store.schema_version(), 2);
        store.read(|t| {
            let first = t.upload_files.get(a).unwrap();
            assert_eq!(first.mime_type.as_str(), "text/plain");
            assert_eq!((first.upload_index, first.upload_count), (1, 2));
            let second = t.upload_files.get(b).unwrap();
            assert_eq!((second.upload_index, second.upload_count), (2, 2));
        });

        let again = store.run_migrations(&replica_migrations().unwrap()).unwrap();
        assert!(again.applied.is_empty());
    }
}
