// SPDX-License-Identifier: MIT

//! Table definitions and schema-version bookkeeping.
//!
//! The version lives in a plain `schema` file next to the database so that
//! other processes (and humans) can read it without opening SQLite.

use std::io;
use std::path::Path;

use crate::error::{Error, Result};

/// Current schema version.  Version 1 stores kept closure metadata in
/// `*.store` files; the engine's one-shot upgrader translates those into the
/// `references` table.
pub const SCHEMA_VERSION: u32 = 2;

/// Every table has the same shape: a key mapping to an ordered list of
/// values.  Single-valued tables use a one-element list.
pub const SCHEMA_SQL: &str = r#"
create table if not exists "validpaths" (
    key   text not null,
    idx   integer not null,
    value text not null,
    primary key (key, idx)
);

create table if not exists "references" (
    key   text not null,
    idx   integer not null,
    value text not null,
    primary key (key, idx)
);

create table if not exists "referers" (
    key   text not null,
    idx   integer not null,
    value text not null,
    primary key (key, idx)
);

create table if not exists "substitutes" (
    key   text not null,
    idx   integer not null,
    value text not null,
    primary key (key, idx)
);

create table if not exists "derivers" (
    key   text not null,
    idx   integer not null,
    value text not null,
    primary key (key, idx)
);
"#;

/// Read `<db_dir>/schema`.  `Ok(None)` means the file does not exist (a
/// fresh or pre-versioning store).
pub fn read_schema_version(db_dir: &Path) -> Result<Option<u32>> {
    let path = db_dir.join("schema");
    match std::fs::read_to_string(&path) {
        Ok(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::CorruptSchema(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            Err(Error::NoPermission(db_dir.to_owned()))
        }
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

/// Write `<db_dir>/schema`.
pub fn write_schema_version(db_dir: &Path, version: u32) -> Result<()> {
    let path = db_dir.join("schema");
    std::fs::write(&path, format!("{version}\n")).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            Error::NoPermission(db_dir.to_owned())
        } else {
            Error::Io { path, source: e }
        }
    })
}
