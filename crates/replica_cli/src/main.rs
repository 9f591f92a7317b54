//! Replica CLI
//!
//! Operator tools for an on-device sync replica.
//!
//! # Commands
//!
//! - `inspect` - Display table row counts, queue depths and journal state
//! - `verify` - Check cross-table invariants
//! - `migrate` - Run pending schema migrations
//! - `sweep` - Reset expired transfers
//! - `checkpoint` - Write a snapshot and empty the journal

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Sync replica maintenance tools.
#[derive(Parser)]
#[command(name = "replica")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the replica directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display table row counts, queue depths and journal state
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Check cross-table invariants
    Verify {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Run pending schema migrations
    Migrate {
        /// Show pending migrations without running them
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Reset transfers whose expiry has passed
    Sweep {
        /// Also replay recorded transfer outcomes
        #[arg(short, long)]
        reattach: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Write a snapshot and empty the journal
    Checkpoint,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Replica path required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::Verify { format } => {
            let path = cli.path.ok_or("Replica path required for verify")?;
            commands::verify::run(&path, format)?;
        }
        Commands::Migrate { dry_run } => {
            let path = cli.path.ok_or("Replica path required for migrate")?;
            commands::migrate::run(&path, dry_run)?;
        }
        Commands::Sweep { reattach, format } => {
            let path = cli.path.ok_or("Replica path required for sweep")?;
            commands::sweep::run(&path, reattach, format)?;
        }
        Commands::Checkpoint => {
            let path = cli.path.ok_or("Replica path required for checkpoint")?;
            commands::checkpoint::run(&path)?;
        }
        Commands::Version => {
            println!("replica CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
