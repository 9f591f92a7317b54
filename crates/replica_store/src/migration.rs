//! Versioned, forward-only schema migrations.
//!
//! Migrations are:
//! - **Ordered**: versions run from 1 to N without gaps
//! - **Forward-only**: there is no `down`; restore a backup instead
//! - **Transactional**: each migration commits together with its version
//! - **Additive**: rows may gain serde-defaulted fields or have content
//!   rewritten; fields are never removed or retyped
//!
//! ```ignore
//! struct LowercaseNames;
//! impl Migration<Tables> for LowercaseNames {
//!     fn version(&self) -> u64 { 1 }
//!     fn name(&self) -> &str { "lowercase_names" }
//!     fn up(&self, txn: &mut Txn<'_, Tables>) -> StoreResult<()> { ... }
//! }
//!
//! let set = MigrationSet::new().with(LowercaseNames)?;
//! store.run_migrations(&set)?;
//! ```

use crate::error::{StoreError, StoreResult};
use crate::store::Schema;
use crate::txn::Txn;
use serde::Serialize;
use std::collections::BTreeMap;

/// Version number for migrations.
pub type MigrationVersion = u64;

/// Information about a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationInfo {
    /// Version number.
    pub version: MigrationVersion,
    /// Human-readable name.
    pub name: String,
    /// Description of what this migration does.
    pub description: Option<String>,
}

/// Result of running pending migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Migrations applied by this run, in order.
    pub applied: Vec<MigrationInfo>,
    /// Schema version after the run.
    pub final_version: MigrationVersion,
}

/// One migration step over schema `S`.
pub trait Migration<S: Schema>: Send + Sync {
    /// Returns the version number for this migration.
    fn version(&self) -> MigrationVersion;

    /// Returns the name of this migration.
    fn name(&self) -> &str;

    /// Returns an optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Rewrites rows. Must be idempotent over rows it already rewrote.
    fn up(&self, txn: &mut Txn<'_, S>) -> StoreResult<()>;
}

/// A registered set of migrations keyed by version.
pub struct MigrationSet<S: Schema> {
    migrations: BTreeMap<MigrationVersion, Box<dyn Migration<S>>>,
}

impl<S: Schema> Default for MigrationSet<S> {
    fn default() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }
}

impl<S: Schema> MigrationSet<S> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the version is already registered.
    pub fn register(&mut self, migration: Box<dyn Migration<S>>) -> StoreResult<()> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(StoreError::migration_failed(format!(
                "migration version {version} already registered"
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Registers a migration, builder style.
    ///
    /// # Errors
    ///
    /// Returns an error if the version is already registered.
    pub fn with(mut self, migration: impl Migration<S> + 'static) -> StoreResult<Self> {
        self.register(Box::new(migration))?;
        Ok(self)
    }

    /// Returns the list of registered migrations.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| self.info(m.as_ref())).collect()
    }

    /// Returns migrations newer than `current`.
    #[must_use]
    pub fn pending(&self, current: MigrationVersion) -> Vec<MigrationInfo> {
        self.pending_migrations(current)
            .map(|m| self.info(m))
            .collect()
    }

    /// Returns the highest registered version, or 0.
    #[must_use]
    pub fn latest_version(&self) -> MigrationVersion {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Validates that versions run from 1 without gaps.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first gap.
    pub fn validate(&self) -> StoreResult<()> {
        for (i, version) in self.migrations.keys().enumerate() {
            let expected = i as u64 + 1;
            if *version != expected {
                return Err(StoreError::migration_failed(format!(
                    "migration version gap: expected {expected}, got {version}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn pending_migrations(
        &self,
        current: MigrationVersion,
    ) -> impl Iterator<Item = &dyn Migration<S>> + '_ {
        self.migrations
            .range(current + 1..)
            .map(|(_, m)| m.as_ref())
    }

    pub(crate) fn info(&self, migration: &dyn Migration<S>) -> MigrationInfo {
        MigrationInfo {
            version: migration.version(),
            name: migration.name().to_string(),
            description: migration.description().map(String::from),
        }
    }
}
