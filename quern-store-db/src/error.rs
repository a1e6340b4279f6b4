// SPDX-License-Identifier: MIT

//! Error types for store database operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for store database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store database operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open database with context
    #[error("failed to open database at '{path}': {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The database location cannot be accessed at all.  The engine treats
    /// this as a demotion to read-only mode, not a fatal error.
    #[error("no permission to access database at '{0}'")]
    NoPermission(PathBuf),

    /// I/O failure on a database-adjacent file (the schema marker).
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The schema file exists but does not hold a decimal version number.
    #[error("schema file '{0}' is corrupt")]
    CorruptSchema(PathBuf),

    /// The on-disk schema is newer than this build understands.
    #[error("store schema is version {found}, but only versions up to {supported} are supported")]
    SchemaTooNew { found: u32, supported: u32 },
}
