//! Background transfer ledger.
//!
//! Maps an OS background-task identifier to the logical transfer it carries.
//! An entry is written before the transfer is handed to the OS, receives the
//! terminal outcome when the OS reports it, and is removed once the owning
//! tracker has consumed that outcome. Because the OS may report completion to
//! a freshly launched process, the outcome is persisted before it is acted on.

use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::{NetworkCacheEntry, ReplicaTables, Tx};
use crate::types::{FileUuid, FileVersion, GoneReason};
use replica_store::RowId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Device to server.
    Upload,
    /// Server to device.
    Download,
}

/// Terminal outcome of an upload, echoed from the server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadBody {
    /// The file was stored; the batch has more files.
    Stored,
    /// The last file of a first-version batch was stored.
    V0BatchComplete,
    /// The last file of an update batch was stored; the server finishes the
    /// batch asynchronously under this id.
    VNBatchDeferred {
        /// Server id to confirm later.
        deferred_upload_id: u64,
    },
    /// The server reports the file gone.
    Gone(GoneReason),
}

/// Terminal outcome of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadBody {
    /// The content landed at `location`.
    Downloaded {
        /// Where the OS put the content.
        location: PathBuf,
        /// Checksum reported by the server, if any.
        checksum: Option<String>,
    },
    /// The server reports the file gone.
    Gone(GoneReason),
}

/// Direction of a ledger entry plus its outcome once known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transfer {
    /// An upload.
    Upload(Option<UploadBody>),
    /// A download.
    Download(Option<DownloadBody>),
}

impl Transfer {
    /// A fresh transfer with no outcome yet.
    #[must_use]
    pub fn pending(direction: Direction) -> Self {
        match direction {
            Direction::Upload => Self::Upload(None),
            Direction::Download => Self::Download(None),
        }
    }

    /// Direction of the transfer.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Upload(_) => Direction::Upload,
            Self::Download(_) => Direction::Download,
        }
    }

    /// Returns true once the outcome is recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Upload(body) => body.is_some(),
            Self::Download(body) => body.is_some(),
        }
    }
}

/// A terminal outcome reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferOutcome {
    /// Outcome of an upload.
    Upload(UploadBody),
    /// Outcome of a download.
    Download(DownloadBody),
}

impl TransferOutcome {
    fn into_transfer(self) -> Transfer {
        match self {
            Self::Upload(body) => Transfer::Upload(Some(body)),
            Self::Download(body) => Transfer::Download(Some(body)),
        }
    }

    fn direction(&self) -> Direction {
        match self {
            Self::Upload(_) => Direction::Upload,
            Self::Download(_) => Direction::Download,
        }
    }
}

/// Records a transfer about to be handed to the OS.
///
/// # Errors
///
/// Fails if the task identifier is already in the ledger.
pub fn create(
    txn: &mut Tx<'_>,
    task_identifier: &str,
    file_uuid: FileUuid,
    file_version: Option<FileVersion>,
    direction: Direction,
) -> ReplicaResult<RowId> {
    if txn.tables().network_cache_entry(task_identifier).is_some() {
        return Err(ReplicaError::invalid_transition(
            format!("transfer {task_identifier}"),
            "recorded",
            "recorded",
        ));
    }
    let id = txn.insert(NetworkCacheEntry {
        task_identifier: task_identifier.to_string(),
        file_uuid,
        file_version,
        transfer: Transfer::pending(direction),
    })?;
    tracing::debug!(task_identifier, %file_uuid, ?direction, "transfer recorded");
    Ok(id)
}

/// Records the terminal outcome of a transfer.
///
/// Recording the same outcome twice is a no-op.
///
/// # Errors
///
/// Fails if the task is unknown, the direction differs, or a different
/// outcome is already recorded.
pub fn complete(txn: &mut Tx<'_>, task_identifier: &str, outcome: TransferOutcome) -> ReplicaResult<RowId> {
    let (id, entry) = txn
        .tables()
        .network_cache_entry(task_identifier)
        .ok_or_else(|| ReplicaError::UnknownTransfer(task_identifier.to_string()))?;

    if entry.transfer.direction() != outcome.direction() {
        return Err(ReplicaError::invalid_transition(
            format!("transfer {task_identifier}"),
            format!("{:?}", entry.transfer.direction()),
            format!("{:?} outcome", outcome.direction()),
        ));
    }
    let transfer = outcome.into_transfer();
    if entry.transfer.is_complete() {
        if entry.transfer == transfer {
            return Ok(id);
        }
        return Err(ReplicaError::invalid_transition(
            format!("transfer {task_identifier}"),
            "completed",
            "completed with a different outcome",
        ));
    }

    txn.modify::<NetworkCacheEntry, _>(id, |e| e.transfer = transfer)?;
    tracing::debug!(task_identifier, "transfer outcome recorded");
    Ok(id)
}

/// Looks up a ledger entry.
#[must_use]
pub fn lookup(tables: &ReplicaTables, task_identifier: &str) -> Option<NetworkCacheEntry> {
    tables
        .network_cache_entry(task_identifier)
        .map(|(_, e)| e.clone())
}

/// Removes a ledger entry. Returns false if there was none.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn remove(txn: &mut Tx<'_>, task_identifier: &str) -> ReplicaResult<bool> {
    match txn.tables().network_cache_entry(task_identifier) {
        Some((id, _)) => {
            txn.delete::<NetworkCacheEntry>(id)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Entries whose outcome is recorded, in creation order.
#[must_use]
pub fn completed_entries(tables: &ReplicaTables) -> Vec<(RowId, NetworkCacheEntry)> {
    tables
        .network_cache
        .filter(|e| e.transfer.is_complete())
        .map(|(id, e)| (id, e.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_store::Store;

    fn store() -> Store<ReplicaTables> {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn create_then_complete() {
        let store = store();
        let file = FileUuid::random();
        store
            .write(|txn| create(txn, "task-1", file, Some(0), Direction::Upload))
            .unwrap();
        assert!(store.read(|t| completed_entries(t)).is_empty());

        store
            .write(|txn| complete(txn, "task-1", TransferOutcome::Upload(UploadBody::Stored)))
            .unwrap();
        let entry = store.read(|t| lookup(t, "task-1")).unwrap();
        assert_eq!(entry.transfer, Transfer::Upload(Some(UploadBody::Stored)));
        assert_eq!(store.read(|t| completed_entries(t)).len(), 1);
    }

    #[test]
    fn repeated_completion_is_a_no_op() {
        let store = store();
        store
            .write(|txn| create(txn, "t", FileUuid::random(), None, Direction::Download))
            .unwrap();
        let outcome = TransferOutcome::Download(DownloadBody::Gone(GoneReason::UserRemoved));
        store.write(|txn| complete(txn, "t", outcome.clone())).unwrap();
        let sequence = store.sequence();
        store.write(|txn| complete(txn, "t", outcome.clone())).unwrap();
        assert_eq!(store.sequence(), sequence);

        let other = TransferOutcome::Download(DownloadBody::Gone(GoneReason::FileRemovedOrRenamed));
        let err = store.write(|txn| complete(txn, "t", other)).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn direction_must_match() {
        let store = store();
        store
            .write(|txn| create(txn, "t", FileUuid::random(), None, Direction::Download))
            .unwrap();
        let err = store
            .write(|txn| complete(txn, "t", TransferOutcome::Upload(UploadBody::Stored)))
            .unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidTransition { .. }));
    }

    #[test]
    fn unknown_task() {
        let store = store();
        let err = store
            .write(|txn| complete(txn, "missing", TransferOutcome::Upload(UploadBody::Stored)))
            .unwrap_err();
        assert!(matches!(err, ReplicaError::UnknownTransfer(_)));
    }

    #[test]
    fn duplicate_task_rejected_and_remove() {
        let store = store();
        let file = FileUuid::random();
        store
            .write(|txn| create(txn, "t", file, None, Direction::Upload))
            .unwrap();
        assert!(store
            .write(|txn| create(txn, "t", file, None, Direction::Upload))
            .is_err());
        assert!(store.write(|txn| remove(txn, "t")).unwrap());
        assert!(!store.write(|txn| remove(txn, "t")).unwrap());
        assert!(store.read(|t| lookup(t, "t")).is_none());
    }
}
