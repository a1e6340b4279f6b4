// SPDX-License-Identifier: MIT

//! Database connection management.

use std::io;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::SCHEMA_SQL;
use crate::transaction::Transaction;

/// SQLite database connection holding the five keyed tables.
pub struct StoreDb {
    pub(crate) conn: Connection,
}

impl StoreDb {
    /// Open (creating if necessary) the database file `db.sqlite` inside
    /// `db_dir`.  Permission failures surface as [`Error::NoPermission`] so
    /// the caller can demote itself to read-only operation.
    pub fn open(db_dir: &Path) -> Result<Self> {
        if let Err(e) = std::fs::create_dir_all(db_dir) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                return Err(Error::NoPermission(db_dir.to_owned()));
            }
            return Err(Error::Io {
                path: db_dir.to_owned(),
                source: e,
            });
        }

        let path = db_dir.join("db.sqlite");
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(&path, flags).map_err(|e| {
            if is_permission_failure(&e) {
                Error::NoPermission(db_dir.to_owned())
            } else {
                Error::DatabaseOpen { path, source: e }
            }
        })?;

        let db = Self { conn };
        db.configure_pragmas()?;
        db.create_schema()?;
        debug!("opened database at {}", db_dir.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure_pragmas()?;
        db.create_schema()?;
        debug!("created in-memory database");
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Begin a transaction.  Commit is explicit; dropping the handle rolls
    /// back.  Transactions nest via [`Transaction::nested`].
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Transaction::new(&mut self.conn)
    }

    /// Raw connection access (autocommit reads).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn is_permission_failure(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::CannotOpen
                || err.code == rusqlite::ErrorCode::ReadOnly
                || err.code == rusqlite::ErrorCode::PermissionDenied
    )
}
