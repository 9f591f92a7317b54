//! Deletion queue.
//!
//! ```text
//! notStarted -> deleting -> waitingForDeferredDeletion -> done
//!                   \________________________________/
//! ```
//!
//! Reaching `done` sets both directory flags on the target (and on every
//! file of a deleted group) and removes the tracker in the same transaction.

use crate::directory;
use crate::error::{ReplicaError, ReplicaResult};
use crate::recovery::ExpiredReset;
use crate::schema::{DeletionStatus, DeletionTracker, DeletionType, ReplicaTables, Tx};
use crate::types::{FileGroupUuid, FileUuid, Timestamp};
use replica_store::RowId;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionTarget {
    /// A file group and all of its files.
    Object(FileGroupUuid),
    /// A single file.
    File(FileUuid),
}

impl DeletionTarget {
    /// Raw uuid of the target.
    #[must_use]
    pub fn uuid(self) -> Uuid {
        match self {
            Self::Object(group) => group.0,
            Self::File(file) => file.0,
        }
    }

    /// Tracker tag of the target.
    #[must_use]
    pub fn deletion_type(self) -> DeletionType {
        match self {
            Self::Object(_) => DeletionType::FileGroupUuid,
            Self::File(_) => DeletionType::FileUuid,
        }
    }

    fn from_tracker(tracker: &DeletionTracker) -> Self {
        match tracker.deletion_type {
            DeletionType::FileGroupUuid => Self::Object(FileGroupUuid(tracker.uuid)),
            DeletionType::FileUuid => Self::File(FileUuid(tracker.uuid)),
        }
    }
}

impl fmt::Display for DeletionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(group) => write!(f, "file group {group}"),
            Self::File(file) => write!(f, "file {file}"),
        }
    }
}

/// Result of queuing a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionQueued {
    /// A new tracker was created.
    Queued(RowId),
    /// A tracker for the target already exists.
    AlreadyQueued(RowId),
    /// The server had already deleted the target; both flags are now set.
    Completed,
}

/// The server's answer to a deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionAccepted {
    /// Deleted synchronously.
    Completed,
    /// Accepted; completion arrives later under this id.
    Deferred {
        /// Server id of the deferred completion.
        deferred_upload_id: u64,
    },
}

/// Flags of the target: (deleted locally, deleted on server).
fn flags(tables: &ReplicaTables, target: DeletionTarget) -> Option<(bool, bool)> {
    match target {
        DeletionTarget::Object(group) => tables
            .object_entry(group)
            .map(|(_, e)| (e.deleted_locally, e.deleted_on_server)),
        DeletionTarget::File(file) => tables
            .file_entry(file)
            .map(|(_, e)| (e.deleted_locally, e.deleted_on_server)),
    }
}

fn mark_deleted(txn: &mut Tx<'_>, target: DeletionTarget) -> ReplicaResult<()> {
    match target {
        DeletionTarget::Object(group) => directory::mark_object_deleted(txn, group),
        DeletionTarget::File(file) => directory::mark_file_deleted(txn, file),
    }
}

/// Queues a deletion.
///
/// # Errors
///
/// Fails with [`ReplicaError::NoObject`] for an unknown target and with
/// [`ReplicaError::AlreadyDeleted`] if it is deleted both locally and on the
/// server.
pub fn queue(txn: &mut Tx<'_>, target: DeletionTarget) -> ReplicaResult<DeletionQueued> {
    let (deleted_locally, deleted_on_server) =
        flags(txn.tables(), target).ok_or_else(|| ReplicaError::NoObject(target.to_string()))?;
    if deleted_locally && deleted_on_server {
        return Err(ReplicaError::AlreadyDeleted(target.to_string()));
    }
    if let Some((id, _)) = txn.tables().deletion(target.uuid()) {
        tracing::debug!(%target, "deletion already queued");
        return Ok(DeletionQueued::AlreadyQueued(id));
    }
    if deleted_on_server {
        mark_deleted(txn, target)?;
        tracing::info!(%target, "deletion completed; already gone on server");
        return Ok(DeletionQueued::Completed);
    }

    let id = txn.insert(DeletionTracker {
        uuid: target.uuid(),
        deletion_type: target.deletion_type(),
        status: DeletionStatus::NotStarted,
        deferred_upload_id: None,
        expiry: None,
        number_retries: 0,
    })?;
    tracing::info!(%target, "deletion queued");
    Ok(DeletionQueued::Queued(id))
}

/// A deletion ready to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDeletion {
    /// Target.
    pub target: DeletionTarget,
    /// Expiry resets so far.
    pub number_retries: u32,
}

/// Deletions that may be sent now, in queue order, at most `limit`.
#[must_use]
pub fn next_deletions(tables: &ReplicaTables, limit: usize) -> Vec<PendingDeletion> {
    tables
        .deletions
        .filter(|t| t.status == DeletionStatus::NotStarted)
        .take(limit)
        .map(|(_, t)| PendingDeletion {
            target: DeletionTarget::from_tracker(t),
            number_retries: t.number_retries,
        })
        .collect()
}

fn tracker(tables: &ReplicaTables, target: DeletionTarget) -> ReplicaResult<(RowId, DeletionTracker)> {
    tables
        .deletion(target.uuid())
        .map(|(id, t)| (id, t.clone()))
        .ok_or_else(|| ReplicaError::UnknownTracker(format!("deletion of {target}")))
}

/// Marks a deletion request as sent.
///
/// # Errors
///
/// Fails if there is no tracker or it is not `notStarted`.
pub fn begin_deletion(
    txn: &mut Tx<'_>,
    target: DeletionTarget,
    now: Timestamp,
    expiry: Duration,
) -> ReplicaResult<()> {
    let (id, current) = tracker(txn.tables(), target)?;
    if current.status != DeletionStatus::NotStarted {
        return Err(ReplicaError::invalid_transition(
            format!("deletion of {target}"),
            current.status,
            DeletionStatus::Deleting,
        ));
    }
    txn.modify::<DeletionTracker, _>(id, |t| {
        t.status = DeletionStatus::Deleting;
        t.expiry = Some(now.saturating_add(expiry));
    })?;
    tracing::debug!(%target, "deletion started");
    Ok(())
}

fn finish(txn: &mut Tx<'_>, id: RowId, target: DeletionTarget) -> ReplicaResult<()> {
    mark_deleted(txn, target)?;
    txn.delete::<DeletionTracker>(id)?;
    tracing::info!(%target, status = %DeletionStatus::Done, "deletion finished");
    Ok(())
}

/// Applies the server's answer to a sent deletion. Returns true once the
/// deletion is done.
///
/// Replaying an answer for a finished deletion is a no-op, as is repeating
/// the same deferred id.
///
/// # Errors
///
/// Fails if the deletion was not sent or is waiting under another id.
pub fn deletion_accepted(
    txn: &mut Tx<'_>,
    target: DeletionTarget,
    accepted: DeletionAccepted,
) -> ReplicaResult<bool> {
    let Some((id, current)) = txn.tables().deletion(target.uuid()).map(|(id, t)| (id, t.clone())) else {
        if flags(txn.tables(), target) == Some((true, true)) {
            return Ok(true);
        }
        return Err(ReplicaError::UnknownTracker(format!("deletion of {target}")));
    };

    match (current.status, accepted) {
        (DeletionStatus::Deleting, DeletionAccepted::Completed) => {
            finish(txn, id, target)?;
            Ok(true)
        }
        (DeletionStatus::Deleting, DeletionAccepted::Deferred { deferred_upload_id }) => {
            txn.modify::<DeletionTracker, _>(id, |t| {
                t.status = DeletionStatus::WaitingForDeferredDeletion;
                t.deferred_upload_id = Some(deferred_upload_id);
                t.expiry = None;
            })?;
            tracing::debug!(%target, deferred_upload_id, "deletion deferred");
            Ok(false)
        }
        (DeletionStatus::WaitingForDeferredDeletion, DeletionAccepted::Deferred { deferred_upload_id })
            if current.deferred_upload_id == Some(deferred_upload_id) =>
        {
            Ok(false)
        }
        (status, _) => Err(ReplicaError::invalid_transition(
            format!("deletion of {target}"),
            status,
            "accepted",
        )),
    }
}

/// Confirms the server finished a deferred deletion.
///
/// # Errors
///
/// Fails if no deletion waits for `deferred_upload_id`.
pub fn confirm_deferred_deletion(txn: &mut Tx<'_>, deferred_upload_id: u64) -> ReplicaResult<DeletionTarget> {
    let (id, target) = txn
        .tables()
        .deletions
        .find(|t| {
            t.status == DeletionStatus::WaitingForDeferredDeletion && t.deferred_upload_id == Some(deferred_upload_id)
        })
        .map(|(id, t)| (id, DeletionTarget::from_tracker(t)))
        .ok_or_else(|| ReplicaError::UnknownTracker(format!("deferred deletion {deferred_upload_id}")))?;
    finish(txn, id, target)?;
    Ok(target)
}

/// Resets `deleting` trackers whose expiry has passed.
///
/// # Errors
///
/// Returns an error if the store write fails.
pub fn reset_expired(txn: &mut Tx<'_>, now: Timestamp) -> ReplicaResult<Vec<ExpiredReset>> {
    let expired: Vec<(RowId, Uuid, u32)> = txn
        .tables()
        .deletions
        .filter(|t| t.status == DeletionStatus::Deleting && t.expiry.is_some_and(|e| e <= now))
        .map(|(id, t)| (id, t.uuid, t.number_retries.saturating_add(1)))
        .collect();
    let mut resets = Vec::with_capacity(expired.len());
    for (id, uuid, retries) in expired {
        txn.modify::<DeletionTracker, _>(id, |t| {
            t.status = DeletionStatus::NotStarted;
            t.expiry = None;
            t.number_retries = retries;
        })?;
        resets.push(ExpiredReset {
            uuid,
            number_retries: retries,
        });
    }
    Ok(resets)
}

/// Deferred deletion ids the server has yet to confirm.
#[must_use]
pub fn pending_deferred(tables: &ReplicaTables) -> Vec<u64> {
    tables
        .deletions
        .filter(|t| t.status == DeletionStatus::WaitingForDeferredDeletion)
        .filter_map(|(_, t)| t.deferred_upload_id)
        .collect()
}
