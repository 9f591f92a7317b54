//! Checkpoint command implementation.

use std::path::Path;

/// Writes a snapshot and empties the journal.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let replica = super::open(path)?;
    let before = replica.stats()?;
    replica.checkpoint()?;
    println!(
        "Checkpoint written at sequence {} ({} journal bytes, {} frames folded)",
        before.sequence, before.journal_bytes, before.frames_since_checkpoint
    );
    Ok(())
}
