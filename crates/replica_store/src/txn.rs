//! Write transactions.
//!
//! A [`Txn`] mutates the live tables directly while recording two logs: an
//! undo list used to roll the tables back if the transaction fails, and the
//! redo [`Change`] list that becomes the transaction's journal frame.

use crate::codec::to_cbor;
use crate::error::{StoreError, StoreResult};
use crate::store::{HasTable, Schema};
use crate::table::{Change, Record, RowId, Table};

pub(crate) type Undo<S> = Box<dyn FnOnce(&mut S)>;

/// Everything a finished transaction leaves behind.
pub(crate) struct TxnParts<S> {
    pub changes: Vec<Change>,
    pub undo: Vec<Undo<S>>,
    pub schema_version: Option<u64>,
}

/// An open write transaction over schema `S`.
pub struct Txn<'a, S: Schema> {
    tables: &'a mut S,
    changes: Vec<Change>,
    undo: Vec<Undo<S>>,
    schema_version: Option<u64>,
}

impl<'a, S: Schema> Txn<'a, S> {
    pub(crate) fn new(tables: &'a mut S) -> Self {
        Self {
            tables,
            changes: Vec::new(),
            undo: Vec::new(),
            schema_version: None,
        }
    }

    /// Read access to every table, including this transaction's own writes.
    #[must_use]
    pub fn tables(&self) -> &S {
        self.tables
    }

    /// Read access to one table.
    #[must_use]
    pub fn table<R: Record>(&self) -> &Table<R>
    where
        S: HasTable<R>,
    {
        <S as HasTable<R>>::table(self.tables)
    }

    /// Gets a row by id.
    #[must_use]
    pub fn get<R: Record>(&self, id: RowId) -> Option<&R>
    where
        S: HasTable<R>,
    {
        self.table::<R>().get(id)
    }

    /// Inserts a row and returns its new id.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::UniqueViolation`] if a key is already taken.
    pub fn insert<R: Record>(&mut self, row: R) -> StoreResult<RowId>
    where
        S: HasTable<R>,
    {
        let table = <S as HasTable<R>>::table_mut(self.tables);
        let id = table.allocate();
        table.check_unique(&row, id)?;
        let bytes = to_cbor(&row)?;
        table.put(id, row);

        self.changes.push(Change {
            table: R::TABLE.to_string(),
            id,
            row: Some(bytes),
        });
        self.undo.push(Box::new(move |s: &mut S| {
            <S as HasTable<R>>::table_mut(s).take(id);
        }));
        Ok(id)
    }

    /// Replaces a row. Returns false, writing nothing, if the row is unchanged.
    ///
    /// # Errors
    ///
    /// Fails if the row does not exist or a key is already taken.
    pub fn update<R: Record>(&mut self, id: RowId, row: R) -> StoreResult<bool>
    where
        S: HasTable<R>,
    {
        let table = <S as HasTable<R>>::table_mut(self.tables);
        let current = table.get(id).ok_or(StoreError::RowNotFound {
            table: R::TABLE,
            id: id.as_u64(),
        })?;
        if *current == row {
            return Ok(false);
        }
        table.check_unique(&row, id)?;
        let bytes = to_cbor(&row)?;
        let previous = table.put(id, row);

        self.changes.push(Change {
            table: R::TABLE.to_string(),
            id,
            row: Some(bytes),
        });
        self.undo.push(Box::new(move |s: &mut S| {
            if let Some(previous) = previous {
                <S as HasTable<R>>::table_mut(s).put(id, previous);
            }
        }));
        Ok(true)
    }

    /// Applies `f` to a copy of the row and writes it back if it changed.
    ///
    /// # Errors
    ///
    /// Fails if the row does not exist or a key is already taken.
    pub fn modify<R, F>(&mut self, id: RowId, f: F) -> StoreResult<bool>
    where
        R: Record,
        S: HasTable<R>,
        F: FnOnce(&mut R),
    {
        let mut row = self
            .get::<R>(id)
            .cloned()
            .ok_or(StoreError::RowNotFound {
                table: R::TABLE,
                id: id.as_u64(),
            })?;
        f(&mut row);
        self.update(id, row)
    }

    /// Deletes a row and returns it.
    ///
    /// # Errors
    ///
    /// Fails if the row does not exist.
    pub fn delete<R: Record>(&mut self, id: RowId) -> StoreResult<R>
    where
        S: HasTable<R>,
    {
        let removed = <S as HasTable<R>>::table_mut(self.tables)
            .take(id)
            .ok_or(StoreError::RowNotFound {
                table: R::TABLE,
                id: id.as_u64(),
            })?;

        self.changes.push(Change {
            table: R::TABLE.to_string(),
            id,
            row: None,
        });
        let restore = removed.clone();
        self.undo.push(Box::new(move |s: &mut S| {
            <S as HasTable<R>>::table_mut(s).put(id, restore);
        }));
        Ok(removed)
    }

    /// Persists a new schema version together with this transaction.
    pub fn set_schema_version(&mut self, version: u64) {
        self.schema_version = Some(version);
    }

    /// Returns true if nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.schema_version.is_none()
    }

    pub(crate) fn into_parts(self) -> TxnParts<S> {
        TxnParts {
            changes: self.changes,
            undo: self.undo,
            schema_version: self.schema_version,
        }
    }
}

/// Reverts the live tables, newest mutation first.
pub(crate) fn rollback<S>(tables: &mut S, undo: Vec<Undo<S>>) {
    for step in undo.into_iter().rev() {
        step(tables);
    }
}
