// SPDX-License-Identifier: MIT

//! SQLite-backed keyed tables for quern store metadata.
//!
//! The engine's data model is five tables mapping a store path to a string
//! or an ordered list of strings: `validpaths`, `references`, `referers`,
//! `substitutes` and `derivers`.  This crate provides those tables with
//! nestable, crash-safe transactions (SQLite savepoints: commit is atomic,
//! dropping a handle rolls back) and the schema-version bookkeeping the
//! engine's upgrade path relies on.
//!
//! The semantics of what goes *into* the tables (closure invariants,
//! substitute encoding, referer symmetry) live in the engine crate; this
//! layer only knows keys and values.

mod connection;
mod error;
mod schema;
mod tables;
mod transaction;

pub use connection::StoreDb;
pub use error::{Error, Result};
pub use schema::{read_schema_version, write_schema_version, SCHEMA_VERSION};
pub use tables::{Table, Tables};
pub use transaction::Transaction;
