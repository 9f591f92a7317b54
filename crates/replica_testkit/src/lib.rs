//! # Replica Testkit
//!
//! Test utilities for the sync replica.
//!
//! This crate provides:
//! - Replica fixtures on a temporary directory or on shared in-memory media,
//!   both driven by a manual clock and able to relaunch
//! - A journal device that fails part way through a write
//! - A map-backed label resolver
//! - Property-based generators for server file indexes
//!
//! ## Usage
//!
//! ```rust
//! use replica_testkit::prelude::*;
//!
//! let fixture = TestReplica::in_memory();
//! fixture.register(&foo_declaration()).unwrap();
//! let fixture = fixture.relaunch();
//! assert!(fixture.declared_object(FOO).is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod resolver;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::resolver::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use resolver::*;
