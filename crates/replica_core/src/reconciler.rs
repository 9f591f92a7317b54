//! Index reconciler: merges the server's file index into the directory.
//!
//! The whole index is applied in one transaction, so a bad row leaves the
//! directory untouched. Applying the same index twice writes nothing the
//! second time.

use crate::declared::declare_from_index;
use crate::directory::{match_sert_with, ServerFileInfo};
use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::Tx;
use crate::types::{FileGroupUuid, SharingGroupUuid};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Derives object types and file labels from app metadata when the server
/// index omits them.
pub trait LabelResolver: Send + Sync {
    /// Object type of a file group, from one of its files' metadata.
    fn object_type(&self, app_meta_data: &str) -> Option<String>;

    /// Label of a file under `object_type`.
    fn file_label(&self, object_type: &str, app_meta_data: &str) -> Option<String>;
}

/// Resolves nothing; every index row must carry its own type and label.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLabelResolver;

impl LabelResolver for NoLabelResolver {
    fn object_type(&self, _app_meta_data: &str) -> Option<String> {
        None
    }

    fn file_label(&self, _object_type: &str, _app_meta_data: &str) -> Option<String> {
        None
    }
}

/// What an index upsert changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Object entries created.
    pub objects_created: usize,
    /// Object entries changed.
    pub objects_updated: usize,
    /// File entries created.
    pub files_created: usize,
    /// File entries changed.
    pub files_updated: usize,
    /// `(object type, label)` pairs declared from the index.
    pub declared_labels: Vec<(String, String)>,
}

impl ReconcileReport {
    /// Returns true if nothing was written.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        *self == Self::default()
    }
}

struct Resolved<'a> {
    info: &'a ServerFileInfo,
    object_type: String,
    file_label: String,
}

fn resolve<'a>(
    info: &'a ServerFileInfo,
    sharing_group: SharingGroupUuid,
    resolver: &dyn LabelResolver,
) -> ReplicaResult<Resolved<'a>> {
    if info.sharing_group_uuid != sharing_group {
        return Err(ReplicaError::SharingGroupMismatch {
            file_uuid: info.file_uuid,
            expected: sharing_group,
            actual: info.sharing_group_uuid,
        });
    }
    let meta = info.app_meta_data.as_deref();
    let object_type = info
        .object_type
        .clone()
        .or_else(|| meta.and_then(|m| resolver.object_type(m)))
        .ok_or(ReplicaError::MissingObjectType(info.file_uuid))?;
    let file_label = info
        .file_label
        .clone()
        .or_else(|| meta.and_then(|m| resolver.file_label(&object_type, m)))
        .ok_or(ReplicaError::MissingFileLabel(info.file_uuid))?;
    Ok(Resolved {
        info,
        object_type,
        file_label,
    })
}

/// Applies a server file index for one sharing group.
///
/// A file group counts as deleted on the server only when every one of its
/// rows in the index is deleted.
///
/// # Errors
///
/// Fails on a repeated file, a row from another sharing group, an
/// unresolvable type or label, and on immutable-field mismatches.
pub fn upsert(
    txn: &mut Tx<'_>,
    index: &[ServerFileInfo],
    sharing_group: SharingGroupUuid,
    resolver: &dyn LabelResolver,
) -> ReplicaResult<ReconcileReport> {
    let mut seen = HashSet::with_capacity(index.len());
    if let Some(repeated) = index.iter().find(|info| !seen.insert(info.file_uuid)) {
        return Err(ReplicaError::DuplicateFileUUIDInIndex(repeated.file_uuid));
    }
    let rows = index
        .iter()
        .map(|info| resolve(info, sharing_group, resolver))
        .collect::<ReplicaResult<Vec<_>>>()?;

    let mut group_deleted: HashMap<FileGroupUuid, bool> = HashMap::new();
    for row in &rows {
        let deleted = group_deleted.entry(row.info.file_group_uuid).or_insert(true);
        *deleted &= row.info.deleted;
    }

    let mut report = ReconcileReport::default();
    for row in &rows {
        if declare_from_index(txn, &row.object_type, &row.file_label, &row.info.mime_type)? {
            report
                .declared_labels
                .push((row.object_type.clone(), row.file_label.clone()));
        }
        let object_deleted = group_deleted
            .get(&row.info.file_group_uuid)
            .copied()
            .unwrap_or(row.info.deleted);
        let written = match_sert_with(txn, row.info, &row.object_type, &row.file_label, object_deleted)?;
        report.objects_created += usize::from(written.object_created);
        report.objects_updated += usize::from(written.object_updated);
        report.files_created += usize::from(written.file_created);
        report.files_updated += usize::from(written.file_updated);
    }

    if report.is_unchanged() {
        tracing::debug!(%sharing_group, rows = index.len(), "index unchanged");
    } else {
        tracing::info!(
            %sharing_group,
            rows = index.len(),
            objects_created = report.objects_created,
            files_created = report.files_created,
            files_updated = report.files_updated,
            "index reconciled"
        );
    }
    Ok(report)
}
