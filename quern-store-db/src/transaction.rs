// SPDX-License-Identifier: MIT

//! Nestable transactions over SQLite savepoints.
//!
//! A [`Transaction`] commits explicitly and rolls back when dropped, so a
//! helper that opened one cannot accidentally leak half-applied writes past
//! an early return.  Nesting hands out an inner savepoint whose rollback is
//! contained within the outer transaction.

use rusqlite::{Connection, Savepoint};

use crate::error::Result;

/// An open (possibly nested) transaction.
pub struct Transaction<'conn> {
    sp: Savepoint<'conn>,
}

impl<'conn> Transaction<'conn> {
    pub(crate) fn new(conn: &'conn mut Connection) -> Result<Self> {
        Ok(Transaction {
            sp: conn.savepoint()?,
        })
    }

    /// Begin a nested transaction scoped inside this one.
    pub fn nested(&mut self) -> Result<Transaction<'_>> {
        Ok(Transaction {
            sp: self.sp.savepoint()?,
        })
    }

    /// Commit atomically.
    pub fn commit(self) -> Result<()> {
        self.sp.commit()?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.sp
    }
}
