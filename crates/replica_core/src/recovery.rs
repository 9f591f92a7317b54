//! Relaunch recovery and expiry sweeps.
//!
//! The OS may finish a background transfer while the process is gone. Its
//! outcome is recorded in the ledger first, so a fresh process can replay it
//! with [`reattach_transfers`]. Transfers that never report back are
//! reclaimed by [`sweep_expired`].

use crate::error::ReplicaResult;
use crate::network_cache::{completed_entries, Transfer};
use crate::schema::{NetworkCacheEntry, ReplicaTables, Tx};
use crate::types::Timestamp;
use crate::{deletion, download, upload};
use replica_store::RowId;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

/// A tracker put back to `notStarted` after its expiry passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpiredReset {
    /// File uuid, or the target uuid of a deletion.
    pub uuid: Uuid,
    /// Retry count after the reset.
    pub number_retries: u32,
}

/// Trackers reset by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Reset uploads.
    pub uploads: Vec<ExpiredReset>,
    /// Reset downloads.
    pub downloads: Vec<ExpiredReset>,
    /// Reset deletions.
    pub deletions: Vec<ExpiredReset>,
    /// Staged upload copies to remove once the sweep commits.
    #[serde(skip)]
    pub released: Vec<PathBuf>,
}

impl SweepReport {
    /// Number of trackers reset.
    #[must_use]
    pub fn total(&self) -> usize {
        self.uploads.len() + self.downloads.len() + self.deletions.len()
    }

    /// Returns true if nothing was reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Resets every expired upload, download and deletion.
///
/// Trackers whose retry count exceeds `retry_warning_threshold` are logged
/// at warn level; they are still retried.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn sweep_expired(txn: &mut Tx<'_>, now: Timestamp, retry_warning_threshold: u32) -> ReplicaResult<SweepReport> {
    let uploads = upload::reset_expired(txn, now)?;
    let report = SweepReport {
        uploads: uploads.resets,
        downloads: download::reset_expired(txn, now)?,
        deletions: deletion::reset_expired(txn, now)?,
        released: uploads.released,
    };
    for (kind, resets) in [
        ("upload", &report.uploads),
        ("download", &report.downloads),
        ("deletion", &report.deletions),
    ] {
        for reset in resets.iter().filter(|r| r.number_retries > retry_warning_threshold) {
            tracing::warn!(kind, uuid = %reset.uuid, retries = reset.number_retries, "transfer keeps expiring");
        }
    }
    if !report.is_empty() {
        tracing::info!(
            uploads = report.uploads.len(),
            downloads = report.downloads.len(),
            deletions = report.deletions.len(),
            "expired trackers reset"
        );
    }
    Ok(report)
}

/// What consuming one ledger outcome did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Consumed {
    pub orphan: bool,
    pub released: Vec<PathBuf>,
}

/// Hands the recorded outcome of ledger entry `entry_id` to its tracker.
pub(crate) fn consume_entry(txn: &mut Tx<'_>, entry_id: RowId) -> ReplicaResult<Consumed> {
    let Some(entry) = txn.get::<NetworkCacheEntry>(entry_id).cloned() else {
        return Ok(Consumed {
            orphan: true,
            released: Vec::new(),
        });
    };
    match entry.transfer {
        Transfer::Upload(Some(body)) => {
            let consumed = upload::consume(txn, entry_id, &body)?;
            Ok(Consumed {
                orphan: consumed.orphan,
                released: consumed.released,
            })
        }
        Transfer::Download(Some(body)) => Ok(Consumed {
            orphan: !download::consume(txn, entry_id, &body)?,
            released: Vec::new(),
        }),
        Transfer::Upload(None) | Transfer::Download(None) => Ok(Consumed::default()),
    }
}

/// What [`reattach_transfers`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReattachReport {
    /// Recorded outcomes handed to their trackers.
    pub replayed: usize,
    /// Entries dropped because no tracker referenced them.
    pub orphans: usize,
    /// Staged copies to remove once the transaction commits.
    #[serde(skip)]
    pub released: Vec<PathBuf>,
}

/// Replays every recorded outcome and drops ledger entries no tracker
/// references.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn reattach_transfers(txn: &mut Tx<'_>) -> ReplicaResult<ReattachReport> {
    let mut report = ReattachReport::default();
    for (entry_id, entry) in completed_entries(txn.tables()) {
        let consumed = consume_entry(txn, entry_id)?;
        if consumed.orphan {
            report.orphans += 1;
        } else {
            report.replayed += 1;
            tracing::debug!(task_identifier = %entry.task_identifier, "transfer outcome replayed");
        }
        report.released.extend(consumed.released);
    }

    let tables = txn.tables();
    let referenced: HashSet<RowId> = tables
        .upload_files
        .iter()
        .filter_map(|(_, t)| t.network_cache_id)
        .chain(tables.download_files.iter().filter_map(|(_, t)| t.network_cache_id))
        .collect();
    let stale: Vec<RowId> = tables
        .network_cache
        .iter()
        .map(|(id, _)| id)
        .filter(|id| !referenced.contains(id))
        .collect();
    for id in stale {
        txn.delete::<NetworkCacheEntry>(id)?;
        report.orphans += 1;
    }

    if report.replayed > 0 || report.orphans > 0 {
        tracing::info!(replayed = report.replayed, orphans = report.orphans, "transfers reattached");
    }
    Ok(report)
}

/// Deferred completions the server has yet to confirm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeferredIds {
    /// Update batches.
    pub uploads: Vec<u64>,
    /// Deletions.
    pub deletions: Vec<u64>,
}

/// Lists outstanding deferred upload and deletion ids.
#[must_use]
pub fn pending_deferred_ids(tables: &ReplicaTables) -> DeferredIds {
    DeferredIds {
        uploads: upload::pending_deferred(tables),
        deletions: deletion::pending_deferred(tables),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_cache::{self, Direction, TransferOutcome, UploadBody};
    use crate::types::FileUuid;
    use replica_store::Store;

    #[test]
    fn unreferenced_entries_are_dropped() {
        let store: Store<ReplicaTables> = Store::open_in_memory().unwrap();
        store
            .write(|txn| {
                network_cache::create(txn, "lost", FileUuid::random(), None, Direction::Upload)?;
                network_cache::create(txn, "done", FileUuid::random(), Some(0), Direction::Upload)?;
                network_cache::complete(txn, "done", TransferOutcome::Upload(UploadBody::Stored))
            })
            .unwrap();

        let report = store.write(reattach_transfers).unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.orphans, 2);
        assert!(store.read(|t| t.network_cache.is_empty()));

        let again = store.write(reattach_transfers).unwrap();
        assert_eq!(again, ReattachReport::default());
    }

    #[test]
    fn empty_sweep_reports_nothing() {
        let store: Store<ReplicaTables> = Store::open_in_memory().unwrap();
        let report = store
            .write(|txn| sweep_expired(txn, Timestamp::from_millis(u64::MAX), 3))
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(store.read(pending_deferred_ids), DeferredIds::default());
    }
}
