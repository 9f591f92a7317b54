//! Cross-table consistency checks.
//!
//! The store enforces per-table uniqueness; these checks cover the
//! references between tables that it cannot see.

use crate::schema::{
    DeletionType, DownloadStatus, ReplicaTables, UploadStatus, VersionClass,
};
use crate::types::{FileGroupUuid, FileUuid};
use replica_store::{RowId, Schema};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Table of the offending row.
    pub table: &'static str,
    /// Offending row.
    pub row: RowId,
    /// What is wrong.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.table, self.row, self.message)
    }
}

/// Result of [`verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Rows inspected.
    pub rows: usize,
    /// Broken invariants.
    pub violations: Vec<Violation>,
}

impl VerifyReport {
    /// Returns true if no invariant is broken.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn flag(&mut self, table: &'static str, row: RowId, message: impl Into<String>) {
        self.violations.push(Violation {
            table,
            row,
            message: message.into(),
        });
    }
}

/// Checks references between tables.
#[must_use]
pub fn verify(tables: &ReplicaTables) -> VerifyReport {
    let mut report = VerifyReport {
        rows: tables.tables().iter().map(|t| t.row_count()).sum(),
        violations: Vec::new(),
    };

    for (id, file) in tables.declared_files.iter() {
        if tables.declared_objects.get(file.object_id).is_none() {
            report.flag("declared_files", id, format!("declared object {} missing", file.object_id));
        }
    }

    for (id, file) in tables.directory_files.iter() {
        if tables.object_entry(file.file_group_uuid).is_none() {
            report.flag(
                "directory_files",
                id,
                format!("file group {} has no directory entry", file.file_group_uuid),
            );
        }
    }

    let mut started_groups: HashSet<FileGroupUuid> = HashSet::new();
    for (id, batch) in tables.upload_objects.iter() {
        let files: Vec<_> = tables.upload_files_of(id).collect();
        if files.is_empty() {
            report.flag("upload_objects", id, "batch has no files");
        }
        let running = files.iter().any(|(_, f)| f.status != UploadStatus::NotStarted);
        if running && !batch.started {
            report.flag("upload_objects", id, "files running in a batch not marked started");
        }
        if batch.started {
            if batch.v0_upload != Some(batch.version_class == VersionClass::V0) {
                report.flag("upload_objects", id, "v0 flag disagrees with batch class");
            }
            if !started_groups.insert(batch.file_group_uuid) {
                report.flag(
                    "upload_objects",
                    id,
                    format!("second started batch for file group {}", batch.file_group_uuid),
                );
            }
        }
    }

    let mut ledger_refs: HashSet<RowId> = HashSet::new();
    for (id, file) in tables.upload_files.iter() {
        if tables.upload_objects.get(file.object_id).is_none() {
            report.flag("upload_files", id, format!("batch {} missing", file.object_id));
        }
        if file.status == UploadStatus::Uploading && file.expiry.is_none() {
            report.flag("upload_files", id, "uploading without expiry");
        }
        check_ledger_ref(&mut report, tables, "upload_files", id, file.network_cache_id, file.file_uuid);
        ledger_refs.extend(file.network_cache_id);
    }

    for (id, object) in tables.download_objects.iter() {
        if tables.download_files_of(id).next().is_none() {
            report.flag("download_objects", id, "download has no files");
        }
        if tables.object_entry(object.file_group_uuid).is_none() {
            report.flag(
                "download_objects",
                id,
                format!("file group {} has no directory entry", object.file_group_uuid),
            );
        }
    }
    for (id, file) in tables.download_files.iter() {
        if tables.download_objects.get(file.object_id).is_none() {
            report.flag("download_files", id, format!("download {} missing", file.object_id));
        }
        if file.status == DownloadStatus::Downloading && file.expiry.is_none() {
            report.flag("download_files", id, "downloading without expiry");
        }
        check_ledger_ref(&mut report, tables, "download_files", id, file.network_cache_id, file.file_uuid);
        ledger_refs.extend(file.network_cache_id);
    }

    for (id, deletion) in tables.deletions.iter() {
        let known = match deletion.deletion_type {
            DeletionType::FileGroupUuid => tables.object_entry(FileGroupUuid(deletion.uuid)).is_some(),
            DeletionType::FileUuid => tables.file_entry(FileUuid(deletion.uuid)).is_some(),
        };
        if !known {
            report.flag("deletions", id, format!("target {} has no directory entry", deletion.uuid));
        }
    }

    for (id, entry) in tables.network_cache.iter() {
        if !entry.transfer.is_complete() && !ledger_refs.contains(&id) {
            report.flag(
                "network_cache",
                id,
                format!("task {} is not referenced by any tracker", entry.task_identifier),
            );
        }
    }

    report
}

fn check_ledger_ref(
    report: &mut VerifyReport,
    tables: &ReplicaTables,
    table: &'static str,
    id: RowId,
    entry_id: Option<RowId>,
    file: FileUuid,
) {
    let Some(entry_id) = entry_id else {
        return;
    };
    match tables.network_cache.get(entry_id) {
        None => report.flag(table, id, format!("ledger entry {entry_id} missing")),
        Some(entry) if entry.file_uuid != file => {
            report.flag(table, id, format!("ledger entry {entry_id} belongs to file {}", entry.file_uuid));
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DownloadFileTracker, DownloadObjectTracker};
    use crate::types::Timestamp;
    use replica_store::Store;

    #[test]
    fn empty_replica_is_clean() {
        let store: Store<ReplicaTables> = Store::open_in_memory().unwrap();
        let report = store.read(verify);
        assert!(report.is_clean());
        assert_eq!(report.rows, 0);
    }

    #[test]
    fn dangling_download_is_reported() {
        let store: Store<ReplicaTables> = Store::open_in_memory().unwrap();
        store
            .write(|txn| {
                let object_id = txn.insert(DownloadObjectTracker {
                    file_group_uuid: FileGroupUuid::random(),
                    queued_at: Timestamp::from_millis(0),
                })?;
                txn.insert(DownloadFileTracker {
                    object_id,
                    file_uuid: FileUuid::random(),
                    status: DownloadStatus::Downloading,
                    number_retries: 0,
                    file_version: 0,
                    local_url: None,
                    check_sum: None,
                    app_meta_data: None,
                    gone_reason: None,
                    expiry: None,
                    network_cache_id: Some(RowId::new(42)),
                })?;
                Ok::<_, replica_store::StoreError>(())
            })
            .unwrap();

        let report = store.read(verify);
        let messages: Vec<String> = report.violations.iter().map(ToString::to_string).collect();
        assert_eq!(report.violations.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("ledger entry row:42 missing")));
        assert!(messages.iter().any(|m| m.contains("without expiry")));
        assert!(messages.iter().any(|m| m.contains("no directory entry")));
    }
}
