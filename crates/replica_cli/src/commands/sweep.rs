//! Sweep command implementation.

use crate::Format;
use replica_core::{ReattachReport, SweepReport};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct SweepResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    reattach: Option<ReattachReport>,
    sweep: SweepReport,
}

/// Resets expired trackers, first replaying recorded outcomes if asked.
pub fn run(path: &Path, reattach: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let replica = super::open(path)?;
    let reattached = if reattach {
        Some(replica.reattach_transfers()?)
    } else {
        None
    };
    let result = SweepResult {
        reattach: reattached,
        sweep: replica.sweep_expired()?,
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => {
            if let Some(report) = &result.reattach {
                println!(
                    "Reattached: {} outcomes replayed, {} orphans dropped",
                    report.replayed, report.orphans
                );
            }
            let sweep = &result.sweep;
            println!(
                "Swept: {} uploads, {} downloads, {} deletions reset",
                sweep.uploads.len(),
                sweep.downloads.len(),
                sweep.deletions.len()
            );
            for reset in sweep.uploads.iter().chain(&sweep.downloads).chain(&sweep.deletions) {
                println!("  {} (retry {})", reset.uuid, reset.number_retries);
            }
        }
    }
    Ok(())
}
