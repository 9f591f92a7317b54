//! Migrate command implementation.

use replica_core::migrations::replica_migrations;
use std::path::Path;
use tracing::info;

/// Runs pending migrations, or lists them with `dry_run`.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Running migrations for {}", path.display());

    let replica = super::open(path)?;
    let set = replica_migrations()?;
    let current = replica.stats()?.schema_version;
    let pending = set.pending(current);

    println!("Migration Status");
    println!("================");
    println!("  Current version: {current}");
    println!("  Latest version:  {}", set.latest_version());

    if pending.is_empty() {
        println!("\nReplica is up to date.");
        return Ok(());
    }

    if dry_run {
        println!("\nPending Migrations:");
        for migration in &pending {
            println!("  v{}: {}", migration.version, migration.name);
            if let Some(desc) = &migration.description {
                println!("      {desc}");
            }
        }
        return Ok(());
    }

    let report = replica.run_migrations()?;
    println!("\nApplied Migrations:");
    for migration in &report.applied {
        println!("  ✓ v{}: {}", migration.version, migration.name);
    }
    println!("\nSchema version is now {}", report.final_version);
    Ok(())
}
