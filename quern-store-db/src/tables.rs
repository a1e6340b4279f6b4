// SPDX-License-Identifier: MIT

//! Generic keyed-table operations.
//!
//! Every table maps `key → [value…]`; single-valued tables store a
//! one-element list.  Setting an empty list removes the pair, which is what
//! keeps the cleanup invariant cheap for the engine (clearing a path's
//! references is `set_strings(path, [])`).

use rusqlite::{params, Connection};

use crate::connection::StoreDb;
use crate::error::Result;
use crate::transaction::Transaction;

/// The five store tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    ValidPaths,
    References,
    Referers,
    Substitutes,
    Derivers,
}

impl Table {
    /// Quoted SQL identifier (`references` is a keyword).
    const fn sql_name(&self) -> &'static str {
        match self {
            Table::ValidPaths => "\"validpaths\"",
            Table::References => "\"references\"",
            Table::Referers => "\"referers\"",
            Table::Substitutes => "\"substitutes\"",
            Table::Derivers => "\"derivers\"",
        }
    }
}

/// Keyed-table operations, available on both [`StoreDb`] (autocommit) and
/// [`Transaction`] handles.
pub trait Tables {
    fn conn(&self) -> &Connection;

    /// Read the single value for `key` (the first list element).
    fn query_string(&self, table: Table, key: &str) -> Result<Option<String>> {
        let sql = format!(
            "select value from {} where key = ?1 order by idx limit 1",
            table.sql_name()
        );
        let mut stmt = self.conn().prepare_cached(&sql)?;
        match stmt.query_row(params![key], |row| row.get(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the ordered value list for `key` (empty if absent).
    fn query_strings(&self, table: Table, key: &str) -> Result<Vec<String>> {
        let sql = format!(
            "select value from {} where key = ?1 order by idx",
            table.sql_name()
        );
        let mut stmt = self.conn().prepare_cached(&sql)?;
        let mut rows = stmt.query(params![key])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Replace the value for `key` with a single string.
    fn set_string(&self, table: Table, key: &str, value: &str) -> Result<()> {
        self.set_strings(table, key, &[value.to_owned()])
    }

    /// Replace the ordered value list for `key`.  An empty list removes the
    /// pair.
    fn set_strings(&self, table: Table, key: &str, values: &[String]) -> Result<()> {
        self.del_pair(table, key)?;
        let sql = format!(
            "insert into {} (key, idx, value) values (?1, ?2, ?3)",
            table.sql_name()
        );
        let mut stmt = self.conn().prepare_cached(&sql)?;
        for (idx, value) in values.iter().enumerate() {
            stmt.execute(params![key, idx as i64, value])?;
        }
        Ok(())
    }

    /// Remove `key` and its values.
    fn del_pair(&self, table: Table, key: &str) -> Result<()> {
        let sql = format!("delete from {} where key = ?1", table.sql_name());
        let mut stmt = self.conn().prepare_cached(&sql)?;
        stmt.execute(params![key])?;
        Ok(())
    }

    /// Enumerate all keys, ordered.
    fn enum_table(&self, table: Table) -> Result<Vec<String>> {
        let sql = format!("select distinct key from {} order by key", table.sql_name());
        let mut stmt = self.conn().prepare_cached(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }
}

impl Tables for StoreDb {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl Tables for Transaction<'_> {
    fn conn(&self) -> &Connection {
        self.connection()
    }
}
