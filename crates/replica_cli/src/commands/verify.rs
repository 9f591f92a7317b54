//! Verify command implementation.

use crate::Format;
use std::path::Path;

/// Runs the verify command. Fails if any invariant is violated.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let replica = super::open(path)?;
    let report = replica.verify();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            println!("Verifying replica at {}", path.display());
            println!("  Rows checked: {}", report.rows);
            for violation in &report.violations {
                println!("  ✗ {violation}");
            }
            println!();
        }
    }

    if report.is_clean() {
        if format == Format::Text {
            println!("✓ Replica verification passed");
        }
        Ok(())
    } else {
        if format == Format::Text {
            println!("✗ Replica verification failed");
        }
        Err(format!("{} invariant violations", report.violations.len()).into())
    }
}
