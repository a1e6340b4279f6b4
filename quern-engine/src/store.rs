// SPDX-License-Identifier: MIT

//! Store operations: the five metadata tables with their closure
//! invariants, and the filesystem side (adding sources and texts,
//! copying, verification).
//!
//! Invariants maintained at every committed transaction boundary:
//! every reference of a valid path is valid; `references` and `referers`
//! are exact inverses; `references`/`referers`/`derivers` entries exist
//! only for usable paths (valid or substitutable); table keys are store
//! paths.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use quern_store_core::derivation::Derivation;
use quern_store_core::hash::{Algorithm, Hash};
use quern_store_core::store_path::{PathSet, StoreDir};
use quern_store_core::substitute::Substitute;
use quern_store_db::{
    read_schema_version, write_schema_version, StoreDb, Table, Tables, Transaction, SCHEMA_VERSION,
};

use crate::archive;
use crate::canonicalise::canonicalise_path_metadata;
use crate::config::Settings;
use crate::error::{Error, IoContext, Result};
use crate::interrupt::check_interrupt;
use crate::pathlocks::PathLocks;
use crate::upgrade;

/// An open store: the settings record, the store root, and the metadata
/// database (absent when the engine runs in read-only mode).
pub struct Store {
    settings: Settings,
    store_dir: StoreDir,
    db: RefCell<Option<StoreDb>>,
    read_only: Cell<bool>,
}

impl Store {
    /// Open the store described by `settings`: create the on-disk layout,
    /// open the database, and bring the schema up to date.  A database
    /// location we cannot access demotes the engine to read-only mode
    /// instead of failing.
    pub fn open(settings: Settings) -> Result<Store> {
        let store_dir = StoreDir::new(&settings.store_dir)?;

        for dir in [&settings.store_dir, &settings.state_dir, &settings.log_dir] {
            if let Err(e) = fs::create_dir_all(dir) {
                if !(e.kind() == std::io::ErrorKind::PermissionDenied && dir.exists()) {
                    return Err(Error::Sys {
                        message: format!("creating directory '{}'", dir.display()),
                        source: e,
                    });
                }
            }
        }

        let store = Store {
            store_dir,
            db: RefCell::new(None),
            read_only: Cell::new(settings.read_only),
            settings,
        };

        if store.read_only.get() {
            return Ok(store);
        }

        match StoreDb::open(&store.settings.db_dir()) {
            Ok(db) => {
                *store.db.borrow_mut() = Some(db);
            }
            Err(quern_store_db::Error::NoPermission(dir)) => {
                warn!(
                    "cannot access the store database at '{}'; continuing read-only",
                    dir.display()
                );
                store.read_only.set(true);
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        }

        store.check_schema()?;
        Ok(store)
    }

    fn check_schema(&self) -> Result<()> {
        let db_dir = self.settings.db_dir();
        let current = read_schema_version(&db_dir)?.unwrap_or(0);
        if current > SCHEMA_VERSION {
            return Err(quern_store_db::Error::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            }
            .into());
        }
        if current < SCHEMA_VERSION {
            upgrade::upgrade_store(self)?;
            write_schema_version(&db_dir, SCHEMA_VERSION)?;
        }
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    pub fn read_only(&self) -> bool {
        self.read_only.get()
    }

    // ── Database access ─────────────────────────────────────────────────

    /// Run `f` against the database for a read; in read-only-without-db
    /// mode, return `default`.
    fn with_db<T>(&self, default: T, f: impl FnOnce(&StoreDb) -> Result<T>) -> Result<T> {
        match &*self.db.borrow() {
            Some(db) => f(db),
            None => Ok(default),
        }
    }

    /// Run `f` inside a transaction; commit if it succeeds, roll back if it
    /// fails.  The closure must route every read through the transaction
    /// handle it is given.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        if self.read_only.get() {
            return Err(Error::other("the store database is read-only"));
        }
        let mut borrow = self.db.borrow_mut();
        let db = borrow.as_mut().expect("database open unless read-only");
        let txn = db.transaction()?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    // ── Validity ────────────────────────────────────────────────────────

    pub fn is_valid_path_in(&self, t: &impl Tables, path: &Path) -> Result<bool> {
        Ok(t.query_string(Table::ValidPaths, &Self::key(path))?.is_some())
    }

    pub fn is_valid_path(&self, path: &Path) -> bool {
        self.with_db(false, |db| self.is_valid_path_in(db, path))
            .unwrap_or(false)
    }

    /// Usable paths are those that are valid or have a substitute.
    pub fn is_realisable_in(&self, t: &impl Tables, path: &Path) -> Result<bool> {
        Ok(self.is_valid_path_in(t, path)? || !self.query_substitutes_in(t, path)?.is_empty())
    }

    pub fn query_path_hash_in(&self, t: &impl Tables, path: &Path) -> Result<Hash> {
        let entry = t
            .query_string(Table::ValidPaths, &Self::key(path))?
            .ok_or_else(|| Error::other(format!("path '{}' is not valid", path.display())))?;
        parse_hash_entry(path, &entry)
    }

    pub fn query_path_hash(&self, path: &Path) -> Result<Hash> {
        match &*self.db.borrow() {
            Some(db) => self.query_path_hash_in(db, path),
            None => Err(Error::other(format!(
                "path '{}' is not valid",
                path.display()
            ))),
        }
    }

    /// Record `path` as valid with its content hash, references and
    /// deriver.  Every reference must already be valid (closure
    /// invariant); registering a path and its references in one
    /// transaction is how outputs become visible atomically.
    pub fn register_valid_path(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        hash: &Hash,
        references: &PathSet,
        deriver: Option<&Path>,
    ) -> Result<()> {
        self.store_dir.assert_store_path(path)?;
        debug!("registering path '{}'", path.display());

        assert_eq!(hash.algorithm(), Algorithm::Sha256);
        txn.set_string(
            Table::ValidPaths,
            &Self::key(path),
            &format!("sha256:{}", hash.to_hex()),
        )?;

        self.set_references(txn, path, references)?;

        for reference in references {
            if !self.is_valid_path_in(txn, reference)? {
                return Err(Error::other(format!(
                    "cannot register path '{}' as valid, since its reference '{}' is invalid",
                    path.display(),
                    reference.display()
                )));
            }
        }

        if let Some(deriver) = deriver {
            self.set_deriver(txn, path, deriver)?;
        }
        Ok(())
    }

    /// Invalidate a path.  The caller is responsible for checking that
    /// there are no referers.  The `references` and `derivers` entries are
    /// cleared only when the path has no substitutes left, which preserves
    /// the cleanup invariant.
    pub fn invalidate_path(&self, txn: &Transaction<'_>, path: &Path) -> Result<()> {
        debug!("unregistering path '{}'", path.display());
        if self.query_substitutes_in(txn, path)?.is_empty() {
            self.set_references(txn, path, &PathSet::new())?;
            txn.del_pair(Table::Derivers, &Self::key(path))?;
        }
        txn.del_pair(Table::ValidPaths, &Self::key(path))?;
        Ok(())
    }

    // ── References ──────────────────────────────────────────────────────

    pub fn query_references_in(&self, t: &impl Tables, path: &Path) -> Result<PathSet> {
        Ok(t.query_strings(Table::References, &Self::key(path))?
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }

    pub fn query_references(&self, path: &Path) -> Result<PathSet> {
        self.with_db(PathSet::new(), |db| self.query_references_in(db, path))
    }

    pub fn query_referers_in(&self, t: &impl Tables, path: &Path) -> Result<PathSet> {
        Ok(t.query_strings(Table::Referers, &Self::key(path))?
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }

    pub fn query_referers(&self, path: &Path) -> Result<PathSet> {
        self.with_db(PathSet::new(), |db| self.query_referers_in(db, path))
    }

    /// Set the outgoing references of `path`, updating the inverse
    /// `referers` mapping of every path gaining or losing an edge.
    pub fn set_references(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        references: &PathSet,
    ) -> Result<()> {
        if !references.is_empty() && !self.is_realisable_in(txn, path)? {
            return Err(Error::other(format!(
                "cannot set references for path '{}' which is invalid and has no substitutes",
                path.display()
            )));
        }

        let old_references = self.query_references_in(txn, path)?;

        txn.set_strings(
            Table::References,
            &Self::key(path),
            &references.iter().map(|p| Self::key(p)).collect::<Vec<_>>(),
        )?;

        for reference in references {
            let mut referers = self.query_referers_in(txn, reference)?;
            referers.insert(path.to_owned());
            txn.set_strings(
                Table::Referers,
                &Self::key(reference),
                &referers.iter().map(|p| Self::key(p)).collect::<Vec<_>>(),
            )?;
        }

        for dropped in old_references.difference(references) {
            let mut referers = self.query_referers_in(txn, dropped)?;
            referers.remove(path);
            txn.set_strings(
                Table::Referers,
                &Self::key(dropped),
                &referers.iter().map(|p| Self::key(p)).collect::<Vec<_>>(),
            )?;
        }

        Ok(())
    }

    /// Extend `closure` with the reflexive-transitive reference closure of
    /// `path`.
    pub fn compute_fs_closure(&self, path: &Path, closure: &mut PathSet) -> Result<()> {
        check_interrupt()?;
        if !closure.insert(path.to_owned()) {
            return Ok(());
        }
        for reference in self.query_references(path)? {
            self.compute_fs_closure(&reference, closure)?;
        }
        Ok(())
    }

    // ── Derivers ────────────────────────────────────────────────────────

    pub fn set_deriver(&self, txn: &Transaction<'_>, path: &Path, deriver: &Path) -> Result<()> {
        self.store_dir.assert_store_path(path)?;
        self.store_dir.assert_store_path(deriver)?;
        if !self.is_realisable_in(txn, path)? {
            return Err(Error::other(format!(
                "path '{}' is not valid",
                path.display()
            )));
        }
        txn.set_string(Table::Derivers, &Self::key(path), &Self::key(deriver))?;
        Ok(())
    }

    pub fn query_deriver_in(&self, t: &impl Tables, path: &Path) -> Result<Option<PathBuf>> {
        Ok(t.query_string(Table::Derivers, &Self::key(path))?
            .map(PathBuf::from))
    }

    pub fn query_deriver(&self, path: &Path) -> Result<Option<PathBuf>> {
        self.with_db(None, |db| self.query_deriver_in(db, path))
    }

    // ── Substitutes ─────────────────────────────────────────────────────

    pub fn query_substitutes_in(&self, t: &impl Tables, path: &Path) -> Result<Vec<Substitute>> {
        // Malformed or unknown-version entries are skipped, not fatal.
        Ok(t.query_strings(Table::Substitutes, &Self::key(path))?
            .iter()
            .filter_map(|packed| Substitute::decode(packed))
            .collect())
    }

    pub fn query_substitutes(&self, path: &Path) -> Result<Vec<Substitute>> {
        self.with_db(Vec::new(), |db| self.query_substitutes_in(db, path))
    }

    /// Register a substitute for `path`.  New substitutes take precedence
    /// over old ones; re-registering an existing invocation moves it to the
    /// front.
    pub fn register_substitute(
        &self,
        txn: &Transaction<'_>,
        path: &Path,
        sub: &Substitute,
    ) -> Result<()> {
        self.store_dir.assert_store_path(path)?;

        let mut subs = self.query_substitutes_in(txn, path)?;
        subs.retain(|s| s != sub);
        subs.insert(0, sub.clone());

        txn.set_strings(
            Table::Substitutes,
            &Self::key(path),
            &subs.iter().map(Substitute::encode).collect::<Vec<_>>(),
        )?;
        Ok(())
    }

    /// Drop every registered substitute.
    pub fn clear_substitutes(&self) -> Result<()> {
        self.with_txn(|txn| {
            for key in txn.enum_table(Table::Substitutes)? {
                txn.del_pair(Table::Substitutes, &key)?;
            }
            Ok(())
        })
    }

    // ── Store I/O ───────────────────────────────────────────────────────

    /// Copy the tree at `src` to `dst` through the archive codec, so the
    /// copy carries exactly the hashed content and nothing else.
    pub fn copy_path(&self, src: &Path, dst: &Path) -> Result<()> {
        debug!("copying '{}' to '{}'", src.display(), dst.display());
        let mut dump = Vec::new();
        archive::dump_path(src, &mut dump)
            .io_context(|| format!("dumping '{}'", src.display()))?;
        archive::restore_path(dst, &mut dump.as_slice())
            .io_context(|| format!("restoring to '{}'", dst.display()))?;
        Ok(())
    }

    /// Add the tree at `src_path` to the store under its content address.
    /// Idempotent: identical content lands on the identical path.
    pub fn add_to_store(&self, src_path: &Path) -> Result<PathBuf> {
        debug!("adding '{}' to the store", src_path.display());

        let hash = archive::hash_path(src_path)
            .io_context(|| format!("hashing '{}'", src_path.display()))?;
        let base_name = src_path
            .file_name()
            .ok_or_else(|| Error::Usage(format!("'{}' has no base name", src_path.display())))?
            .to_string_lossy()
            .into_owned();
        let dst_path = self.store_dir.make_store_path("source", &hash, &base_name);

        // The unlocked check is only an optimisation to avoid taking the
        // lock when the path is already there.
        if !self.read_only.get() && !self.is_valid_path(&dst_path) {
            let mut output_lock = PathLocks::new();
            output_lock.lock_paths(std::slice::from_ref(&dst_path))?;

            if !self.is_valid_path(&dst_path) {
                if dst_path.exists() {
                    delete_path(&dst_path)?;
                }

                // The source may change between hashing and copying; the
                // re-hash below catches that.
                self.copy_path(src_path, &dst_path)?;

                let hash2 = archive::hash_path(&dst_path)
                    .io_context(|| format!("hashing '{}'", dst_path.display()))?;
                if hash != hash2 {
                    return Err(Error::other(format!(
                        "contents of '{}' changed while copying it to '{}'",
                        src_path.display(),
                        dst_path.display()
                    )));
                }

                canonicalise_path_metadata(&dst_path)?;

                self.with_txn(|txn| {
                    self.register_valid_path(txn, &dst_path, &hash, &PathSet::new(), None)
                })?;
            }

            output_lock.set_deletion(true);
        }

        Ok(dst_path)
    }

    /// Add a string to the store as `<digest>-<suffix>` with the given
    /// references (which must be valid).
    pub fn add_text_to_store(
        &self,
        suffix: &str,
        text: &str,
        references: &PathSet,
    ) -> Result<PathBuf> {
        let hash = Algorithm::Sha256.digest(text);
        let dst_path = self.store_dir.make_store_path("text", &hash, suffix);

        if !self.read_only.get() && !self.is_valid_path(&dst_path) {
            let mut output_lock = PathLocks::new();
            output_lock.lock_paths(std::slice::from_ref(&dst_path))?;

            if !self.is_valid_path(&dst_path) {
                if dst_path.exists() {
                    delete_path(&dst_path)?;
                }

                fs::write(&dst_path, text)
                    .io_context(|| format!("writing '{}'", dst_path.display()))?;

                canonicalise_path_metadata(&dst_path)?;

                let content_hash = archive::hash_path(&dst_path)
                    .io_context(|| format!("hashing '{}'", dst_path.display()))?;
                self.with_txn(|txn| {
                    self.register_valid_path(txn, &dst_path, &content_hash, references, None)
                })?;
            }

            output_lock.set_deletion(true);
        }

        Ok(dst_path)
    }

    /// Read and parse the derivation stored at `drv_path`.
    pub fn read_derivation(&self, drv_path: &Path) -> Result<Derivation> {
        let text = fs::read_to_string(drv_path)
            .io_context(|| format!("reading derivation '{}'", drv_path.display()))?;
        Derivation::parse(&text).map_err(|source| Error::BadTerm {
            path: drv_path.to_owned(),
            source,
        })
    }

    /// Delete a path from the store (disk and database).  Refuses when the
    /// path is still referenced by anything other than itself.
    pub fn delete_from_store(&self, path: &Path) -> Result<()> {
        self.store_dir.assert_store_path(path)?;

        self.with_txn(|txn| {
            if self.is_valid_path_in(txn, path)? {
                let referers = self.query_referers_in(txn, path)?;
                if referers.iter().any(|r| r != path) {
                    return Err(Error::other(format!(
                        "cannot delete path '{}' because it is in use",
                        path.display()
                    )));
                }
                self.invalidate_path(txn, path)?;
            }
            Ok(())
        })?;

        if path.exists() {
            delete_path(path)?;
        }
        Ok(())
    }

    // ── Verification ────────────────────────────────────────────────────

    /// Audit every table, repairing what can be repaired destructively in
    /// one transaction and warning about the rest.  With `check_contents`
    /// each valid path is re-hashed against its recorded hash.
    pub fn verify_store(&self, check_contents: bool) -> Result<()> {
        self.with_txn(|txn| {
            let mut valid_paths = BTreeSet::new();

            for key in txn.enum_table(Table::ValidPaths)? {
                check_interrupt()?;
                let path = PathBuf::from(&key);
                if !path.exists() {
                    error!("path '{key}' disappeared");
                    self.invalidate_path(txn, &path)?;
                } else if !self.store_dir.is_store_path(&path) {
                    error!("path '{key}' is not in the store");
                    self.invalidate_path(txn, &path)?;
                } else {
                    if check_contents {
                        let entry = txn
                            .query_string(Table::ValidPaths, &key)?
                            .expect("enumerated key is present");
                        let expected = parse_hash_entry(&path, &entry)?;
                        let current = archive::hash_path(&path)
                            .io_context(|| format!("hashing '{key}'"))?;
                        if current != expected {
                            error!(
                                "path '{key}' was modified! expected hash '{}', got '{}'",
                                expected.to_hex(),
                                current.to_hex()
                            );
                        }
                    }
                    valid_paths.insert(path);
                }
            }

            // Usable paths are those that are valid or have a substitute.
            let mut usable_paths = valid_paths.clone();
            for key in txn.enum_table(Table::Substitutes)? {
                check_interrupt()?;
                let path = PathBuf::from(&key);
                let subs = self.query_substitutes_in(txn, &path)?;
                if !self.store_dir.is_store_path(&path) {
                    error!("found substitutes for non-store path '{key}'");
                    txn.del_pair(Table::Substitutes, &key)?;
                } else if subs.is_empty() {
                    txn.del_pair(Table::Substitutes, &key)?;
                } else {
                    usable_paths.insert(path);
                }
            }

            for key in txn.enum_table(Table::Derivers)? {
                check_interrupt()?;
                let path = PathBuf::from(&key);
                if !usable_paths.contains(&path) {
                    error!("found deriver entry for unusable path '{key}'");
                    txn.del_pair(Table::Derivers, &key)?;
                } else {
                    let deriver = self
                        .query_deriver_in(txn, &path)?
                        .expect("enumerated key is present");
                    if !self.store_dir.is_store_path(&deriver) {
                        error!("found corrupt deriver '{}' for '{key}'", deriver.display());
                        txn.del_pair(Table::Derivers, &key)?;
                    }
                }
            }

            for key in txn.enum_table(Table::References)? {
                check_interrupt()?;
                let path = PathBuf::from(&key);
                if !usable_paths.contains(&path) {
                    error!("found references entry for unusable path '{key}'");
                    txn.del_pair(Table::References, &key)?;
                } else {
                    let is_valid = valid_paths.contains(&path);
                    for reference in self.query_references_in(txn, &path)? {
                        let referers = self.query_referers_in(txn, &reference)?;
                        if !referers.contains(&path) {
                            error!(
                                "missing referer mapping from '{}' to '{key}'",
                                reference.display()
                            );
                        }
                        if is_valid && !valid_paths.contains(&reference) {
                            error!(
                                "incomplete closure: '{key}' needs missing '{}'",
                                reference.display()
                            );
                        }
                    }
                }
            }

            for key in txn.enum_table(Table::Referers)? {
                check_interrupt()?;
                let path = PathBuf::from(&key);
                if !usable_paths.contains(&path) {
                    error!("found referers entry for unusable path '{key}'");
                    txn.del_pair(Table::Referers, &key)?;
                } else {
                    for referer in self.query_referers_in(txn, &path)? {
                        let references = self.query_references_in(txn, &referer)?;
                        if !references.contains(&path) {
                            error!(
                                "missing reference mapping from '{}' to '{key}'",
                                referer.display()
                            );
                        }
                    }
                }
            }

            Ok(())
        })
    }
}

fn parse_hash_entry(path: &Path, entry: &str) -> Result<Hash> {
    let (algo, hex) = entry.split_once(':').ok_or_else(|| {
        Error::other(format!(
            "corrupt hash '{entry}' in valid-path entry for '{}'",
            path.display()
        ))
    })?;
    let algorithm: Algorithm = algo
        .parse()
        .map_err(|e| Error::other(format!("valid-path entry for '{}': {e}", path.display())))?;
    Hash::parse_hex(algorithm, hex)
        .map_err(|e| Error::other(format!("valid-path entry for '{}': {e}", path.display())))
}

/// Remove a tree, restoring write permission on directories first (store
/// contents are canonicalised read-only).
pub fn delete_path(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .io_context(|| format!("getting attributes of '{}'", path.display()))?;
    if meta.is_dir() {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .io_context(|| format!("making '{}' writable", path.display()))?;
        for entry in
            fs::read_dir(path).io_context(|| format!("reading directory '{}'", path.display()))?
        {
            let entry =
                entry.io_context(|| format!("reading directory '{}'", path.display()))?;
            delete_path(&entry.path())?;
        }
        fs::remove_dir(path).io_context(|| format!("removing directory '{}'", path.display()))?;
    } else {
        fs::remove_file(path).io_context(|| format!("removing file '{}'", path.display()))?;
    }
    Ok(())
}
