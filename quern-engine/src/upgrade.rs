// SPDX-License-Identifier: MIT

//! One-shot schema upgrade from version 1.
//!
//! Version 1 stores recorded no content hashes and kept closure metadata
//! in `*.store` files (legacy closure terms) among the store objects.  The
//! upgrade hashes every valid path that lacks a hash and translates each
//! closure element's references into the `references` table.  Invalid
//! closures are skipped; references to invalid paths are preserved but
//! warned about so a later verify can deal with them.  Work is committed
//! in chunks of at most 1000 elements to keep individual transactions
//! bounded.

use std::path::PathBuf;

use tracing::{error, info, warn};

use quern_store_core::derivation::parse_legacy_closure;
use quern_store_core::store_path::PathSet;
use quern_store_db::{Table, Tables};

use crate::archive;
use crate::error::{IoContext, Result};
use crate::interrupt::check_interrupt;
use crate::store::Store;

const CHUNK: usize = 1000;

pub fn upgrade_store(store: &Store) -> Result<()> {
    let keys = store.with_txn(|txn| txn.enum_table(Table::ValidPaths).map_err(Into::into))?;
    if keys.is_empty() {
        return Ok(());
    }

    info!("upgrading the store to the current schema (this may take a while)...");
    let valid_paths: PathSet = keys.iter().map(PathBuf::from).collect();

    // Pass 1: fill in missing content hashes.
    for chunk in keys.chunks(CHUNK) {
        store.with_txn(|txn| {
            for key in chunk {
                check_interrupt()?;
                let entry = txn.query_string(Table::ValidPaths, key)?;
                if entry.as_deref() != Some("") {
                    continue;
                }
                let path = PathBuf::from(key);
                if !path.exists() {
                    warn!("valid path '{key}' is missing; skipping");
                    continue;
                }
                let hash = archive::hash_path(&path).io_context(|| format!("hashing '{key}'"))?;
                txn.set_string(Table::ValidPaths, key, &format!("sha256:{}", hash.to_hex()))?;
            }
            Ok(())
        })?;
    }

    // Pass 2: translate legacy closure files into the references table.
    let mut pending: Vec<(PathBuf, PathSet)> = Vec::new();
    for key in &keys {
        check_interrupt()?;
        if !key.ends_with(".store") {
            continue;
        }
        let closure_path = PathBuf::from(key);
        let text = match std::fs::read_to_string(&closure_path) {
            Ok(text) => text,
            Err(e) => {
                warn!("cannot read closure '{key}': {e}");
                continue;
            }
        };
        let closure = match parse_legacy_closure(&text) {
            Ok(closure) => closure,
            Err(e) => {
                warn!("skipping invalid closure '{key}': {e}");
                continue;
            }
        };

        for (path, references) in closure.elements {
            if !valid_paths.contains(&path) {
                // Normal: old stores did not enforce closure on closure
                // store expressions.
                continue;
            }
            let mut refs = PathSet::new();
            for reference in references {
                if !valid_paths.contains(&reference) {
                    error!(
                        "closure '{key}' contains reference from '{}' to invalid path '{}' \
                         (run a store verify)",
                        path.display(),
                        reference.display()
                    );
                }
                refs.insert(reference);
            }
            pending.push((path, refs));
        }
    }

    for chunk in pending.chunks(CHUNK) {
        store.with_txn(|txn| {
            for (path, references) in chunk {
                check_interrupt()?;
                let previous = store.query_references_in(txn, path)?;
                if !previous.is_empty() && previous != *references {
                    warn!("conflicting references for '{}'", path.display());
                }
                if previous != *references {
                    store.set_references(txn, path, references)?;
                }
            }
            Ok(())
        })?;
    }

    Ok(())
}
