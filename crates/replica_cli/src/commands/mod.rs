//! CLI command implementations.

pub mod checkpoint;
pub mod inspect;
pub mod migrate;
pub mod sweep;
pub mod verify;

use replica_core::{Replica, ReplicaConfig};
use replica_store::StoreConfig;
use std::path::Path;

/// Opens an existing replica without touching its queues.
///
/// Migrations and reattachment are left to the commands that ask for them.
pub fn open(path: &Path) -> Result<Replica, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No replica found at {}", path.display()).into());
    }
    let config = ReplicaConfig::new()
        .store(StoreConfig::new().create_if_missing(false))
        .migrate_on_open(false)
        .reattach_on_open(false);
    Ok(Replica::open_with_config(path, config)?)
}
