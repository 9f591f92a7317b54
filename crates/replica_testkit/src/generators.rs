//! Property-based test generators using proptest.
//!
//! Index strategies keep the invariants the server guarantees: file UUIDs
//! are unique, and every row of a file group agrees on the group's object
//! type, sharing group and storage provider.

use proptest::prelude::*;
use replica_core::{
    CloudStorageType, FileGroupUuid, FileUuid, MimeType, ServerFileInfo, SharingGroupUuid, Timestamp,
};
use uuid::Uuid;

/// Strategy for random UUIDs.
pub fn uuid_strategy() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// Strategy for storage providers.
pub fn cloud_storage_strategy() -> impl Strategy<Value = CloudStorageType> {
    prop_oneof![
        Just(CloudStorageType::Dropbox),
        Just(CloudStorageType::Google),
        Just(CloudStorageType::Solid),
    ]
}

/// Strategy for object type names.
pub fn object_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{2,8}").expect("Invalid regex")
}

/// Strategy for MIME types, mixed case included.
pub fn mime_type_strategy() -> impl Strategy<Value = MimeType> {
    prop_oneof![
        Just("text/plain"),
        Just("image/jpeg"),
        Just("IMAGE/PNG"),
        Just("application/json"),
    ]
    .prop_map(MimeType::new)
}

#[derive(Debug, Clone)]
struct FileRow {
    uuid: Uuid,
    mime_type: MimeType,
    version: u32,
    deleted: bool,
    created: u64,
}

fn file_row_strategy() -> impl Strategy<Value = FileRow> {
    (uuid_strategy(), mime_type_strategy(), 0u32..6, any::<bool>(), 0u64..1 << 40).prop_map(
        |(uuid, mime_type, version, deleted, created)| FileRow {
            uuid,
            mime_type,
            version,
            deleted,
            created,
        },
    )
}

/// Strategy for the index rows of one file group in `sharing`.
///
/// Files are labelled `part0`, `part1`, ... in order.
pub fn file_group_index_strategy(sharing: SharingGroupUuid) -> impl Strategy<Value = Vec<ServerFileInfo>> {
    (
        uuid_strategy(),
        object_type_strategy(),
        cloud_storage_strategy(),
        prop::collection::vec(file_row_strategy(), 1..4),
    )
        .prop_map(move |(group, object_type, cloud, rows)| {
            rows.into_iter()
                .enumerate()
                .map(|(i, row)| ServerFileInfo {
                    file_uuid: FileUuid(row.uuid),
                    file_group_uuid: FileGroupUuid(group),
                    sharing_group_uuid: sharing,
                    mime_type: row.mime_type,
                    deleted: row.deleted,
                    file_version: row.version,
                    cloud_storage_type: cloud,
                    object_type: Some(object_type.clone()),
                    file_label: Some(format!("part{i}")),
                    app_meta_data: None,
                    creation_date: Timestamp::from_millis(row.created),
                })
                .collect()
        })
}

/// Strategy for a whole sharing group's index: one to four file groups.
pub fn server_index_strategy(sharing: SharingGroupUuid) -> impl Strategy<Value = Vec<ServerFileInfo>> {
    prop::collection::vec(file_group_index_strategy(sharing), 1..5)
        .prop_map(|groups| groups.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    proptest! {
        #[test]
        fn index_rows_are_consistent(index in server_index_strategy(SharingGroupUuid(Uuid::nil()))) {
            let files: HashSet<_> = index.iter().map(|r| r.file_uuid).collect();
            prop_assert_eq!(files.len(), index.len());

            let mut groups: HashMap<FileGroupUuid, (&Option<String>, CloudStorageType)> = HashMap::new();
            for row in &index {
                let seen = groups
                    .entry(row.file_group_uuid)
                    .or_insert((&row.object_type, row.cloud_storage_type));
                prop_assert_eq!(seen.0, &row.object_type);
                prop_assert_eq!(seen.1, row.cloud_storage_type);
                prop_assert!(row.mime_type.is_normalized());
            }
        }
    }
}
