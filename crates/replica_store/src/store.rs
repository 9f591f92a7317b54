//! The table store: live tables over a journal and a snapshot slot.

use crate::backend::{LogDevice, SnapshotSlot};
use crate::codec::{from_cbor, to_cbor};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::file::{FileLog, FileSnapshot};
use crate::frame::{self, FrameKind, JOURNAL_MAGIC, SNAPSHOT_MAGIC};
use crate::memory::{MemoryLog, MemorySnapshot};
use crate::migration::{MigrationReport, MigrationSet};
use crate::table::{AnyTable, Change, Record, Table};
use crate::txn::{rollback, Txn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

/// A set of tables making up one store.
///
/// Implementors are plain structs of [`Table`] fields; `tables` and
/// `tables_mut` list them so replay and checkpoints can reach every table
/// without knowing row types.
pub trait Schema: Default + Send + Sync + 'static {
    /// Every table, in a fixed order.
    fn tables(&self) -> Vec<&dyn AnyTable>;

    /// Every table, mutably, in the same order.
    fn tables_mut(&mut self) -> Vec<&mut dyn AnyTable>;
}

/// Typed access from a schema to one of its tables.
pub trait HasTable<R: Record> {
    /// The table of `R` rows.
    fn table(&self) -> &Table<R>;

    /// The table of `R` rows, mutably.
    fn table_mut(&mut self) -> &mut Table<R>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    sequence: u64,
    schema_version: Option<u64>,
    changes: Vec<Change>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    sequence: u64,
    schema_version: u64,
    high_water: Vec<(String, u64)>,
    rows: Vec<Change>,
}

/// Row count of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Live rows.
    pub rows: usize,
}

/// Store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Sequence number of the last commit.
    pub sequence: u64,
    /// Persisted schema version.
    pub schema_version: u64,
    /// Current journal length in bytes.
    pub journal_bytes: u64,
    /// Frames written since the last checkpoint.
    pub frames_since_checkpoint: u64,
    /// Per-table row counts.
    pub tables: Vec<TableStats>,
}

struct Inner<S> {
    tables: S,
    log: Box<dyn LogDevice>,
    snapshot: Box<dyn SnapshotSlot>,
    sequence: u64,
    schema_version: u64,
    frames_since_checkpoint: u64,
}

impl<S: Schema> Inner<S> {
    fn append_commit(&mut self, changes: Vec<Change>, schema_version: Option<u64>, sync: bool) -> StoreResult<()> {
        let record = CommitRecord {
            sequence: self.sequence + 1,
            schema_version,
            changes,
        };
        let frame = frame::encode_frame(JOURNAL_MAGIC, FrameKind::Commit, &to_cbor(&record)?)?;

        let start = self.log.len()?;
        let written = self.log.append(&frame).and_then(|_| {
            if sync {
                self.log.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(cleanup) = self.log.truncate(start) {
                tracing::warn!(error = %cleanup, "failed to discard partial journal frame");
            }
            return Err(e);
        }

        self.sequence = record.sequence;
        if let Some(version) = schema_version {
            self.schema_version = version;
        }
        self.frames_since_checkpoint += 1;
        Ok(())
    }

    fn checkpoint(&mut self) -> StoreResult<()> {
        let mut rows = Vec::new();
        let mut high_water = Vec::new();
        for table in self.tables.tables() {
            table.dump(&mut rows)?;
            high_water.push((table.name().to_string(), table.high_water()));
        }
        let image = SnapshotImage {
            sequence: self.sequence,
            schema_version: self.schema_version,
            high_water,
            rows,
        };
        let bytes = frame::encode_frame(SNAPSHOT_MAGIC, FrameKind::Image, &to_cbor(&image)?)?;
        self.snapshot.save(&bytes)?;
        self.log.truncate(0)?;
        self.frames_since_checkpoint = 0;
        tracing::debug!(sequence = self.sequence, "checkpoint written");
        Ok(())
    }
}

fn apply_change<S: Schema>(tables: &mut S, change: &Change) -> StoreResult<()> {
    for table in tables.tables_mut() {
        if table.name() == change.table {
            return table.apply(change);
        }
    }
    Err(StoreError::UnknownTable(change.table.clone()))
}

fn raise_high_water<S: Schema>(tables: &mut S, name: &str, next: u64) -> StoreResult<()> {
    for table in tables.tables_mut() {
        if table.name() == name {
            table.raise_high_water(next);
            return Ok(());
        }
    }
    Err(StoreError::UnknownTable(name.to_string()))
}

/// A durable, single-writer table store.
///
/// Readers and the writer are serialized by one lock; readers only ever see
/// committed state because a failed write is rolled back before the lock is
/// released.
pub struct Store<S: Schema> {
    config: StoreConfig,
    dir: Option<StoreDir>,
    inner: RwLock<Inner<S>>,
}

impl<S: Schema> Store<S> {
    /// Opens a store directory with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked, unreadable or corrupted.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked, unreadable or corrupted.
    pub fn open_with_config(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let log = FileLog::open(&dir.journal_path())?;
        let snapshot = FileSnapshot::new(&dir.snapshot_path());
        Self::recover(config, Some(dir), Box::new(log), Box::new(snapshot))
    }

    /// Opens a fresh store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible to match the other constructors.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_with_media(
            StoreConfig::default(),
            Box::new(MemoryLog::new()),
            Box::new(MemorySnapshot::new()),
        )
    }

    /// Opens a store over caller-supplied media.
    ///
    /// # Errors
    ///
    /// Returns an error if the media hold a corrupted journal or snapshot.
    pub fn open_with_media(
        config: StoreConfig,
        log: Box<dyn LogDevice>,
        snapshot: Box<dyn SnapshotSlot>,
    ) -> StoreResult<Self> {
        Self::recover(config, None, log, snapshot)
    }

    fn recover(
        config: StoreConfig,
        dir: Option<StoreDir>,
        mut log: Box<dyn LogDevice>,
        snapshot: Box<dyn SnapshotSlot>,
    ) -> StoreResult<Self> {
        let mut tables = S::default();
        let mut sequence = 0;
        let mut schema_version = 0;

        if let Some(bytes) = snapshot.load()? {
            let frame = frame::decode_single(&bytes, SNAPSHOT_MAGIC)?;
            if frame.kind != FrameKind::Image {
                return Err(StoreError::corrupted("snapshot does not hold an image frame"));
            }
            let image: SnapshotImage = from_cbor(&frame.payload)?;
            for change in &image.rows {
                apply_change(&mut tables, change)?;
            }
            for (name, next) in &image.high_water {
                raise_high_water(&mut tables, name, *next)?;
            }
            sequence = image.sequence;
            schema_version = image.schema_version;
        }

        let bytes = log.read_from(0)?;
        let scan = frame::scan(&bytes, 0)?;
        if scan.torn_bytes > 0 {
            tracing::warn!(
                torn_bytes = scan.torn_bytes,
                valid_len = scan.valid_len,
                "discarding torn journal tail"
            );
            log.truncate(scan.valid_len)?;
        }

        let mut replayed = 0u64;
        for frame in &scan.frames {
            if frame.kind != FrameKind::Commit {
                return Err(StoreError::corrupted(format!(
                    "unexpected frame kind {:?} at offset {}",
                    frame.kind, frame.offset
                )));
            }
            let record: CommitRecord = from_cbor(&frame.payload)?;
            if record.sequence <= sequence {
                continue;
            }
            if record.sequence != sequence + 1 {
                return Err(StoreError::corrupted(format!(
                    "journal sequence jumps from {sequence} to {}",
                    record.sequence
                )));
            }
            for change in &record.changes {
                apply_change(&mut tables, change)?;
            }
            sequence = record.sequence;
            if let Some(version) = record.schema_version {
                schema_version = version;
            }
            replayed += 1;
        }

        tracing::info!(sequence, schema_version, replayed, "store opened");

        Ok(Self {
            config,
            dir,
            inner: RwLock::new(Inner {
                tables,
                log,
                snapshot,
                sequence,
                schema_version,
                frames_since_checkpoint: scan.frames.len() as u64,
            }),
        })
    }

    /// Returns the store directory, if the store lives on disk.
    #[must_use]
    pub fn dir(&self) -> Option<&StoreDir> {
        self.dir.as_ref()
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Runs `f` against committed state.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&self.inner.read().tables)
    }

    /// Runs `f` as one atomic transaction.
    ///
    /// On `Ok` the transaction's changes are appended to the journal as one
    /// frame; a transaction that changed nothing writes no frame. On `Err`,
    /// on a panic in `f`, or if the append fails, every mutation is rolled
    /// back. A panic is resumed after the rollback.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or the journal error converted into `E`.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Txn<'_, S>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut txn = Txn::new(&mut inner.tables);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut txn)));
        let parts = txn.into_parts();
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                rollback(&mut inner.tables, parts.undo);
                tracing::error!("transaction panicked; rolled back");
                panic::resume_unwind(payload);
            }
        };

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                rollback(&mut inner.tables, parts.undo);
                return Err(e);
            }
        };
        if parts.changes.is_empty() && parts.schema_version.is_none() {
            return Ok(value);
        }

        if let Err(e) = inner.append_commit(parts.changes, parts.schema_version, self.config.sync_on_commit) {
            rollback(&mut inner.tables, parts.undo);
            return Err(e.into());
        }

        let threshold = self.config.checkpoint_after_frames;
        if threshold > 0 && inner.frames_since_checkpoint >= threshold {
            if let Err(e) = inner.checkpoint() {
                tracing::warn!(error = %e, "automatic checkpoint failed");
            }
        }
        Ok(value)
    }

    /// Writes a snapshot of every table and truncates the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be saved.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.inner.write().checkpoint()
    }

    /// Returns the persisted schema version.
    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.inner.read().schema_version
    }

    /// Returns the sequence number of the last commit.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.inner.read().sequence
    }

    /// Collects store statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal length cannot be read.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.inner.read();
        Ok(StoreStats {
            sequence: inner.sequence,
            schema_version: inner.schema_version,
            journal_bytes: inner.log.len()?,
            frames_since_checkpoint: inner.frames_since_checkpoint,
            tables: inner
                .tables
                .tables()
                .into_iter()
                .map(|t| TableStats {
                    name: t.name().to_string(),
                    rows: t.row_count(),
                })
                .collect(),
        })
    }

    /// Runs every migration in `set` newer than the persisted schema version.
    ///
    /// Each migration commits in its own transaction together with its
    /// version, so a crash between two migrations resumes at the next one.
    ///
    /// # Errors
    ///
    /// Fails if the set has gaps, if the store is newer than the set, or if a
    /// migration fails. Migrations applied before the failure stay applied.
    pub fn run_migrations(&self, set: &MigrationSet<S>) -> StoreResult<MigrationReport> {
        set.validate()?;
        let current = self.schema_version();
        if current > set.latest_version() {
            return Err(StoreError::migration_failed(format!(
                "store schema version {current} is newer than the latest known migration {}",
                set.latest_version()
            )));
        }

        let mut report = MigrationReport {
            applied: Vec::new(),
            final_version: current,
        };
        for migration in set.pending_migrations(current) {
            let version = migration.version();
            self.write(|txn| {
                migration.up(txn)?;
                txn.set_schema_version(version);
                Ok::<_, StoreError>(())
            })
            .map_err(|e| {
                StoreError::migration_failed(format!(
                    "migration {version} ({}) failed: {e}",
                    migration.name()
                ))
            })?;
            tracing::info!(version, name = migration.name(), "migration applied");
            report.applied.push(set.info(migration));
            report.final_version = version;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::UniqueKey;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        key: String,
        count: u32,
    }

    impl Record for Item {
        const TABLE: &'static str = "items";

        fn unique_keys(&self) -> Vec<UniqueKey> {
            vec![UniqueKey::new("key", &self.key)]
        }
    }

    #[derive(Debug, Default)]
    struct Tables {
        items: Table<Item>,
    }

    impl Schema for Tables {
        fn tables(&self) -> Vec<&dyn AnyTable> {
            vec![&self.items]
        }

        fn tables_mut(&mut self) -> Vec<&mut dyn AnyTable> {
            vec![&mut self.items]
        }
    }

    impl HasTable<Item> for Tables {
        fn table(&self) -> &Table<Item> {
            &self.items
        }

        fn table_mut(&mut self) -> &mut Table<Item> {
            &mut self.items
        }
    }

    fn item(key: &str, count: u32) -> Item {
        Item {
            key: key.into(),
            count,
        }
    }

    fn open(log: &MemoryLog, snapshot: &MemorySnapshot) -> Store<Tables> {
        Store::open_with_media(
            StoreConfig::default().checkpoint_after_frames(0),
            Box::new(log.clone()),
            Box::new(snapshot.clone()),
        )
        .unwrap()
    }

    #[test]
    fn committed_writes_survive_reopen() {
        let log = MemoryLog::new();
        let snapshot = MemorySnapshot::new();
        let id = {
            let store = open(&log, &snapshot);
            store.write(|txn| txn.insert(item("a", 1))).unwrap()
        };

        let store = open(&log, &snapshot);
        assert_eq!(store.sequence(), 1);
        let row = store.read(|t| t.items.get(id).cloned()).unwrap();
        assert_eq!(row, item("a", 1));
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = Store::<Tables>::open_in_memory().unwrap();
        store.write(|txn| txn.insert(item("a", 1))).unwrap();

        let result: StoreResult<()> = store.write(|txn| {
            txn.insert(item("b", 1))?;
            txn.insert(item("a", 2))?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::UniqueViolation { .. })));
        assert_eq!(store.read(|t| t.items.len()), 1);
        assert!(store.read(|t| t.items.by_key("key", "b").is_none()));
        assert_eq!(store.sequence(), 1);
    }

    #[test]
    fn rollback_restores_updates_and_deletes() {
        let store = Store::<Tables>::open_in_memory().unwrap();
        let (a, b) = store
            .write(|txn| Ok::<_, StoreError>((txn.insert(item("a", 1))?, txn.insert(item("b", 1))?)))
            .unwrap();

        let result: StoreResult<()> = store.write(|txn| {
            txn.modify::<Item, _>(a, |row| row.count = 9)?;
            txn.delete::<Item>(b)?;
            Err(StoreError::corrupted("abort"))
        });
        assert!(result.is_err());
        assert_eq!(store.read(|t| t.items.get(a).cloned()), Some(item("a", 1)));
        assert_eq!(store.read(|t| t.items.get(b).cloned()), Some(item("b", 1)));
    }

    #[test]
    fn panicking_write_rolls_back() {
        let log = MemoryLog::new();
        let store = open(&log, &MemorySnapshot::new());
        let a = store.write(|txn| txn.insert(item("a", 1))).unwrap();
        let len = log.len().unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: StoreResult<()> = store.write(|txn| {
                txn.insert(item("b", 1))?;
                txn.modify::<Item, _>(a, |row| row.count = 5)?;
                panic!("writer failed midway");
            });
        }));
        assert!(result.is_err());
        assert_eq!(store.read(|t| t.items.len()), 1);
        assert_eq!(store.read(|t| t.items.get(a).cloned()), Some(item("a", 1)));
        assert_eq!(log.len().unwrap(), len);
        assert_eq!(store.sequence(), 1);

        store.write(|txn| txn.insert(item("b", 2))).unwrap();
        assert_eq!(store.sequence(), 2);
    }

    #[test]
    fn identical_update_writes_nothing() {
        let log = MemoryLog::new();
        let store = open(&log, &MemorySnapshot::new());
        let id = store.write(|txn| txn.insert(item("a", 1))).unwrap();
        let len = log.len().unwrap();

        let changed = store.write(|txn| txn.update(id, item("a", 1))).unwrap();
        assert!(!changed);
        assert_eq!(log.len().unwrap(), len);
        assert_eq!(store.sequence(), 1);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let log = MemoryLog::new();
        let snapshot = MemorySnapshot::new();
        {
            let store = open(&log, &snapshot);
            store.write(|txn| txn.insert(item("a", 1))).unwrap();
            store.write(|txn| txn.insert(item("b", 1))).unwrap();
        }
        let mut bytes = log.bytes();
        bytes.truncate(bytes.len() - 3);
        let torn = MemoryLog::with_bytes(bytes);

        let store = open(&torn, &snapshot);
        assert_eq!(store.sequence(), 1);
        assert_eq!(store.read(|t| t.items.len()), 1);
        // the next commit lands on a clean boundary
        store.write(|txn| txn.insert(item("c", 1))).unwrap();
        drop(store);
        let store = open(&torn, &snapshot);
        assert_eq!(store.read(|t| t.items.len()), 2);
    }

    #[test]
    fn checksum_damage_is_fatal() {
        let log = MemoryLog::new();
        let snapshot = MemorySnapshot::new();
        open(&log, &snapshot)
            .write(|txn| txn.insert(item("a", 1)))
            .unwrap();
        let mut bytes = log.bytes();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;

        let result = Store::<Tables>::open_with_media(
            StoreConfig::default(),
            Box::new(MemoryLog::with_bytes(bytes)),
            Box::new(snapshot),
        );
        assert!(matches!(result, Err(e) if e.is_corruption()));
    }

    #[test]
    fn checkpoint_truncates_journal_and_keeps_ids() {
        let log = MemoryLog::new();
        let snapshot = MemorySnapshot::new();
        let deleted = {
            let store = open(&log, &snapshot);
            store.write(|txn| txn.insert(item("a", 1))).unwrap();
            let b = store.write(|txn| txn.insert(item("b", 1))).unwrap();
            store.write(|txn| txn.delete::<Item>(b)).unwrap();
            store.checkpoint().unwrap();
            assert_eq!(log.len().unwrap(), 0);
            b
        };

        let store = open(&log, &snapshot);
        assert_eq!(store.sequence(), 3);
        assert_eq!(store.read(|t| t.items.len()), 1);
        let fresh = store.write(|txn| txn.insert(item("c", 1))).unwrap();
        assert!(fresh > deleted);
    }

    #[test]
    fn automatic_checkpoint() {
        let log = MemoryLog::new();
        let snapshot = MemorySnapshot::new();
        let store = Store::<Tables>::open_with_media(
            StoreConfig::default().checkpoint_after_frames(2),
            Box::new(log.clone()),
            Box::new(snapshot.clone()),
        )
        .unwrap();
        store.write(|txn| txn.insert(item("a", 1))).unwrap();
        assert!(log.len().unwrap() > 0);
        store.write(|txn| txn.insert(item("b", 1))).unwrap();
        assert_eq!(log.len().unwrap(), 0);
        assert!(snapshot.load().unwrap().is_some());
    }

    #[test]
    fn stats_report_tables() {
        let store = Store::<Tables>::open_in_memory().unwrap();
        store.write(|txn| txn.insert(item("a", 1))).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.sequence, 1);
        assert_eq!(
            stats.tables,
            vec![TableStats {
                name: "items".into(),
                rows: 1
            }]
        );
    }

    #[test]
    fn on_disk_store_reopens() {
        let temp = tempfile::tempdir().unwrap();
        let id = {
            let store = Store::<Tables>::open(temp.path()).unwrap();
            store.write(|txn| txn.insert(item("a", 4))).unwrap()
        };
        let store = Store::<Tables>::open(temp.path()).unwrap();
        assert_eq!(store.read(|t| t.items.get(id).map(|i| i.count)), Some(4));
        assert!(store.dir().is_some());
    }
}
