//! Typed tables: arenas of rows keyed by surrogate id with unique indexes.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Surrogate key of a row within its table.
///
/// Row ids are assigned in increasing order and never reused, including
/// across checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl RowId {
    /// Creates a row id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row:{}", self.0)
    }
}

/// A value that must be unique across a table under a named constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    constraint: &'static str,
    value: String,
}

impl UniqueKey {
    /// Creates a key for `constraint`.
    pub fn new(constraint: &'static str, value: impl fmt::Display) -> Self {
        Self {
            constraint,
            value: value.to_string(),
        }
    }

    /// Returns the constraint name.
    #[must_use]
    pub fn constraint(&self) -> &'static str {
        self.constraint
    }

    /// Returns the key value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A row type stored in a [`Table`].
pub trait Record:
    Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Table name, stable across releases; it is written to the journal.
    const TABLE: &'static str;

    /// Uniqueness constraints this row participates in.
    ///
    /// Keys are derived from row content, so a constraint may apply only in
    /// some states (for example, only while a batch is running).
    fn unique_keys(&self) -> Vec<UniqueKey> {
        Vec::new()
    }
}

/// One row-level mutation as written to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Table name.
    pub table: String,
    /// Row id.
    pub id: RowId,
    /// CBOR encoding of the row after the change; `None` deletes it.
    pub row: Option<Vec<u8>>,
}

/// Type-erased view of a table, used for replay and checkpoints.
pub trait AnyTable: Send + Sync {
    /// Table name.
    fn name(&self) -> &'static str;

    /// Number of live rows.
    fn row_count(&self) -> usize;

    /// Next id that would be allocated.
    fn high_water(&self) -> u64;

    /// Raises the allocation mark to at least `next`.
    fn raise_high_water(&mut self, next: u64);

    /// Appends every live row as a put change.
    fn dump(&self, out: &mut Vec<Change>) -> StoreResult<()>;

    /// Applies a journaled change.
    fn apply(&mut self, change: &Change) -> StoreResult<()>;
}

/// An arena of rows of type `R`.
#[derive(Debug, Clone)]
pub struct Table<R: Record> {
    rows: BTreeMap<RowId, R>,
    unique: HashMap<UniqueKey, RowId>,
    next_id: u64,
}

impl<R: Record> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            unique: HashMap::new(),
            next_id: 1,
        }
    }
}

impl<R: Record> Table<R> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gets a row by id.
    #[must_use]
    pub fn get(&self, id: RowId) -> Option<&R> {
        self.rows.get(&id)
    }

    /// Iterates rows in id order.
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &R)> + '_ {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    /// Iterates rows matching `pred` in id order.
    pub fn filter<'a, P>(&'a self, pred: P) -> impl Iterator<Item = (RowId, &'a R)> + 'a
    where
        P: Fn(&R) -> bool + 'a,
    {
        self.iter().filter(move |(_, row)| pred(row))
    }

    /// Returns the first row matching `pred`.
    pub fn find<P>(&self, pred: P) -> Option<(RowId, &R)>
    where
        P: Fn(&R) -> bool,
    {
        self.iter().find(|(_, row)| pred(row))
    }

    /// Looks a row up through a unique constraint.
    pub fn by_key(&self, constraint: &'static str, value: impl fmt::Display) -> Option<(RowId, &R)> {
        let key = UniqueKey::new(constraint, value);
        let id = *self.unique.get(&key)?;
        self.rows.get(&id).map(|row| (id, row))
    }

    pub(crate) fn allocate(&mut self) -> RowId {
        let id = RowId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Fails if any key of `row` is held by a row other than `id`.
    pub(crate) fn check_unique(&self, row: &R, id: RowId) -> StoreResult<()> {
        for key in row.unique_keys() {
            if let Some(owner) = self.unique.get(&key) {
                if *owner != id {
                    return Err(StoreError::UniqueViolation {
                        table: R::TABLE,
                        constraint: key.constraint,
                        key: key.value,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stores `row` under `id`, keeping the unique index in step.
    pub(crate) fn put(&mut self, id: RowId, row: R) -> Option<R> {
        let previous = self.take(id);
        for key in row.unique_keys() {
            self.unique.insert(key, id);
        }
        self.rows.insert(id, row);
        if id.0 >= self.next_id {
            self.next_id = id.0 + 1;
        }
        previous
    }

    pub(crate) fn take(&mut self, id: RowId) -> Option<R> {
        let row = self.rows.remove(&id)?;
        for key in row.unique_keys() {
            if self.unique.get(&key) == Some(&id) {
                self.unique.remove(&key);
            }
        }
        Some(row)
    }
}

impl<R: Record> AnyTable for Table<R> {
    fn name(&self) -> &'static str {
        R::TABLE
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn high_water(&self) -> u64 {
        self.next_id
    }

    fn raise_high_water(&mut self, next: u64) {
        self.next_id = self.next_id.max(next);
    }

    fn dump(&self, out: &mut Vec<Change>) -> StoreResult<()> {
        for (id, row) in &self.rows {
            out.push(Change {
                table: R::TABLE.to_string(),
                id: *id,
                row: Some(to_cbor(row)?),
            });
        }
        Ok(())
    }

    fn apply(&mut self, change: &Change) -> StoreResult<()> {
        match &change.row {
            Some(bytes) => {
                let row: R = from_cbor(bytes)?;
                self.put(change.id, row);
            }
            None => {
                self.take(change.id);
            }
        }
        self.raise_high_water(change.id.0 + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        uuid: String,
        active: bool,
    }

    impl Record for Entry {
        const TABLE: &'static str = "entries";

        fn unique_keys(&self) -> Vec<UniqueKey> {
            let mut keys = vec![UniqueKey::new("uuid", &self.uuid)];
            if self.active {
                keys.push(UniqueKey::new("active", "singleton"));
            }
            keys
        }
    }

    fn entry(uuid: &str, active: bool) -> Entry {
        Entry {
            uuid: uuid.into(),
            active,
        }
    }

    #[test]
    fn put_indexes_unique_keys() {
        let mut table = Table::new();
        let id = table.allocate();
        table.put(id, entry("a", false));

        let (found, row) = table.by_key("uuid", "a").unwrap();
        assert_eq!(found, id);
        assert_eq!(row.uuid, "a");
        assert!(table.by_key("uuid", "b").is_none());
    }

    #[test]
    fn check_unique_rejects_other_owner() {
        let mut table = Table::new();
        let first = table.allocate();
        table.put(first, entry("a", false));

        let second = table.allocate();
        assert!(matches!(
            table.check_unique(&entry("a", false), second),
            Err(StoreError::UniqueViolation { constraint: "uuid", .. })
        ));
        // the owner itself may keep its key
        assert!(table.check_unique(&entry("a", true), first).is_ok());
    }

    #[test]
    fn conditional_keys_follow_row_state() {
        let mut table = Table::new();
        let a = table.allocate();
        table.put(a, entry("a", true));
        let b = table.allocate();
        assert!(table.check_unique(&entry("b", true), b).is_err());

        table.put(a, entry("a", false));
        assert!(table.by_key("active", "singleton").is_none());
        assert!(table.check_unique(&entry("b", true), b).is_ok());
    }

    #[test]
    fn take_drops_keys() {
        let mut table = Table::new();
        let id = table.allocate();
        table.put(id, entry("a", false));
        assert_eq!(table.take(id).unwrap().uuid, "a");
        assert!(table.by_key("uuid", "a").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut table: Table<Entry> = Table::new();
        let first = table.allocate();
        table.put(first, entry("a", false));
        table.take(first);
        assert!(table.allocate() > first);
    }

    #[test]
    fn dump_then_apply_rebuilds_table() {
        let mut table = Table::new();
        for name in ["a", "b", "c"] {
            let id = table.allocate();
            table.put(id, entry(name, false));
        }
        let mut changes = Vec::new();
        table.dump(&mut changes).unwrap();

        let mut rebuilt: Table<Entry> = Table::new();
        for change in &changes {
            rebuilt.apply(change).unwrap();
        }
        assert_eq!(rebuilt.len(), 3);
        assert!(rebuilt.by_key("uuid", "b").is_some());
        assert_eq!(rebuilt.high_water(), table.high_water());
    }

    #[test]
    fn filter_and_find() {
        let mut table = Table::new();
        for (name, active) in [("a", false), ("b", true), ("c", false)] {
            let id = table.allocate();
            table.put(id, entry(name, active));
        }
        assert_eq!(table.filter(|e| !e.active).count(), 2);
        assert_eq!(table.find(|e| e.active).unwrap().1.uuid, "b");
    }
}
