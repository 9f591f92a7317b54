//! Inspect command implementation.

use crate::Format;
use replica_core::migrations::replica_migrations;
use replica_core::{DeletionStatus, DeferredIds, DownloadStatus, Replica, UploadStatus};
use replica_store::TableStats;
use serde::Serialize;
use std::path::Path;

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Replica path.
    pub path: String,
    /// Sequence number of the last commit.
    pub sequence: u64,
    /// Persisted schema version.
    pub schema_version: u64,
    /// Newest schema version this build knows.
    pub latest_schema_version: u64,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Frames written since the last checkpoint.
    pub frames_since_checkpoint: u64,
    /// Row counts per table.
    pub tables: Vec<TableStats>,
    /// Upload, download and deletion depths.
    pub queues: QueueStats,
    /// Deferred completions still unconfirmed.
    pub deferred: DeferredIds,
}

/// Tracker counts by status.
#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    /// Upload files not yet handed to the transport.
    pub uploads_waiting: usize,
    /// Upload files in flight.
    pub uploads_in_flight: usize,
    /// Download files not yet handed to the transport.
    pub downloads_waiting: usize,
    /// Download files in flight.
    pub downloads_in_flight: usize,
    /// Downloaded files the app has not taken.
    pub downloads_completed: usize,
    /// Deletions not yet sent.
    pub deletions_waiting: usize,
    /// Deletions sent or waiting for deferred confirmation.
    pub deletions_in_flight: usize,
    /// Ledger entries whose outcome is recorded but not consumed.
    pub unconsumed_outcomes: usize,
}

fn queue_stats(replica: &Replica) -> QueueStats {
    replica.read(|t| QueueStats {
        uploads_waiting: t.upload_files.filter(|f| f.status == UploadStatus::NotStarted).count(),
        uploads_in_flight: t.upload_files.filter(|f| f.status == UploadStatus::Uploading).count(),
        downloads_waiting: t.download_files.filter(|f| f.status == DownloadStatus::NotStarted).count(),
        downloads_in_flight: t.download_files.filter(|f| f.status == DownloadStatus::Downloading).count(),
        downloads_completed: t.download_files.filter(|f| f.status == DownloadStatus::Downloaded).count(),
        deletions_waiting: t.deletions.filter(|d| d.status == DeletionStatus::NotStarted).count(),
        deletions_in_flight: t.deletions.filter(|d| d.status != DeletionStatus::NotStarted).count(),
        unconsumed_outcomes: t.network_cache.filter(|e| e.transfer.is_complete()).count(),
    })
}

/// Collects inspection data from an open replica.
pub fn collect(path: &Path, replica: &Replica) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let stats = replica.stats()?;
    Ok(InspectResult {
        path: path.display().to_string(),
        sequence: stats.sequence,
        schema_version: stats.schema_version,
        latest_schema_version: replica_migrations()?.latest_version(),
        journal_bytes: stats.journal_bytes,
        frames_since_checkpoint: stats.frames_since_checkpoint,
        tables: stats.tables,
        queues: queue_stats(replica),
        deferred: replica.pending_deferred_ids(),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let replica = super::open(path)?;
    let result = collect(path, &replica)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Replica: {}", result.path);
    println!();
    println!("Store");
    println!("  Sequence:        {}", result.sequence);
    println!(
        "  Schema version:  {} (latest {})",
        result.schema_version, result.latest_schema_version
    );
    println!("  Journal:         {} bytes, {} frames", result.journal_bytes, result.frames_since_checkpoint);
    println!();
    println!("Tables");
    for table in &result.tables {
        println!("  {:<18} {:>8}", table.name, table.rows);
    }
    println!();
    let q = &result.queues;
    println!("Queues");
    println!("  Uploads:    {} waiting, {} in flight", q.uploads_waiting, q.uploads_in_flight);
    println!(
        "  Downloads:  {} waiting, {} in flight, {} completed",
        q.downloads_waiting, q.downloads_in_flight, q.downloads_completed
    );
    println!("  Deletions:  {} waiting, {} in flight", q.deletions_waiting, q.deletions_in_flight);
    println!("  Unconsumed outcomes: {}", q.unconsumed_outcomes);
    if !result.deferred.uploads.is_empty() || !result.deferred.deletions.is_empty() {
        println!();
        println!("Deferred");
        println!("  Uploads:    {:?}", result.deferred.uploads);
        println!("  Deletions:  {:?}", result.deferred.deletions);
    }
    if result.schema_version < result.latest_schema_version {
        println!();
        println!("! Schema is behind; run `replica migrate`");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::{FileGroupUuid, FileUuid, SharingGroupUuid};
    use replica_testkit::{foo_declaration, foo_upload, FILE1};

    #[test]
    fn collects_queue_depths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica");
        {
            let replica = Replica::open(&path).unwrap();
            replica.register(&foo_declaration()).unwrap();
            replica
                .queue_upload(&foo_upload(
                    FileGroupUuid::random(),
                    SharingGroupUuid::random(),
                    &[(FileUuid::random(), FILE1)],
                ))
                .unwrap();
        }

        let replica = crate::commands::open(&path).unwrap();
        let result = collect(&path, &replica).unwrap();
        assert_eq!(result.queues.uploads_waiting, 1);
        assert_eq!(result.schema_version, result.latest_schema_version);
        let uploads = result.tables.iter().find(|t| t.name == "upload_files").unwrap();
        assert_eq!(uploads.rows, 1);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["queues"]["uploads_waiting"], 1);
    }

    #[test]
    fn missing_replica_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(crate::commands::open(&dir.path().join("absent")).is_err());
    }
}
