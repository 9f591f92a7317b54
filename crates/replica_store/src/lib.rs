//! # Replica Store
//!
//! Durable single-writer table store backing the sync replica.
//!
//! The store keeps every table in memory and makes it durable through a
//! commit journal plus a periodic snapshot:
//!
//! - Each [`Store::write`] transaction becomes exactly one checksummed
//!   journal frame, so a transaction is atomic on disk
//! - A torn frame at the journal tail is a crash mid-write and is discarded
//!   on open; a checksum mismatch anywhere is fatal
//! - [`Store::checkpoint`] writes a snapshot image and truncates the journal
//! - Tables declare uniqueness constraints through [`Record::unique_keys`];
//!   the store rejects violations inside the transaction
//!
//! ## Media
//!
//! - [`FileLog`] / [`FileSnapshot`] - OS files inside a locked [`StoreDir`]
//! - [`MemoryLog`] / [`MemorySnapshot`] - shared in-memory handles for tests
//!   and ephemeral stores
//!
//! ## Example
//!
//! ```rust
//! use replica_store::{AnyTable, HasTable, Record, Schema, Store, Table};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Note {
//!     text: String,
//! }
//!
//! impl Record for Note {
//!     const TABLE: &'static str = "notes";
//! }
//!
//! #[derive(Default)]
//! struct Tables {
//!     notes: Table<Note>,
//! }
//!
//! impl Schema for Tables {
//!     fn tables(&self) -> Vec<&dyn AnyTable> {
//!         vec![&self.notes]
//!     }
//!     fn tables_mut(&mut self) -> Vec<&mut dyn AnyTable> {
//!         vec![&mut self.notes]
//!     }
//! }
//!
//! impl HasTable<Note> for Tables {
//!     fn table(&self) -> &Table<Note> {
//!         &self.notes
//!     }
//!     fn table_mut(&mut self) -> &mut Table<Note> {
//!         &mut self.notes
//!     }
//! }
//!
//! let store = Store::<Tables>::open_in_memory().unwrap();
//! let id = store
//!     .write(|txn| txn.insert(Note { text: "hello".into() }))
//!     .unwrap();
//! assert_eq!(store.read(|t| t.notes.get(id).map(|n| n.text.clone())).as_deref(), Some("hello"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod codec;
mod config;
mod dir;
mod error;
mod file;
pub mod frame;
mod memory;
mod migration;
mod store;
mod table;
mod txn;

pub use backend::{LogDevice, SnapshotSlot};
pub use codec::{from_cbor, to_cbor};
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use file::{FileLog, FileSnapshot};
pub use memory::{MemoryLog, MemorySnapshot};
pub use migration::{Migration, MigrationInfo, MigrationReport, MigrationSet, MigrationVersion};
pub use store::{HasTable, Schema, Store, StoreStats, TableStats};
pub use table::{AnyTable, Change, Record, RowId, Table, UniqueKey};
pub use txn::Txn;
