//! Store path computation and validation.
//!
//! A store path is `<root>/<digest>-<suffix>` where `<digest>` is the
//! nix-base32 rendering of a 20-byte XOR-compression of a SHA-256 over a
//! canonical descriptor string.  All operations here are pure; the engine
//! layers locking and registration on top.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::base32::{is_base32_char, to_nix_base32};
use crate::hash::{Algorithm, Hash};

/// Encoded length of a store path digest (20 bytes in nix-base32).
pub const DIGEST_LEN: usize = 32;

/// An ordered set of paths, the working currency of the engine.
pub type PathSet = BTreeSet<PathBuf>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorePathError {
    #[error("path '{0}' is not in the store")]
    NotInStore(PathBuf),
    #[error("store directory '{0}' must be an absolute path")]
    NotAbsolute(PathBuf),
}

/// The fixed store root directory, the prefix of every store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir {
    path: String,
}

impl StoreDir {
    pub fn new(path: impl AsRef<Path>) -> Result<StoreDir, StorePathError> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(StorePathError::NotAbsolute(path.to_owned()));
        }
        let mut path = path.to_string_lossy().into_owned();
        while path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        Ok(StoreDir { path })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.path)
    }

    /// Is `path` lexically inside the store (at any depth)?
    pub fn is_in_store(&self, path: &Path) -> bool {
        let Some(s) = path.to_str() else {
            return false;
        };
        s.starts_with(&self.path)
            && s.len() > self.path.len() + 1
            && s.as_bytes()[self.path.len()] == b'/'
    }

    /// Is `path` a top-level store entry (in the store, no inner slash)?
    pub fn is_store_path(&self, path: &Path) -> bool {
        if !self.is_in_store(path) {
            return false;
        }
        let s = path.to_str().expect("checked by is_in_store");
        !s[self.path.len() + 1..].contains('/')
    }

    pub fn assert_store_path(&self, path: &Path) -> Result<(), StorePathError> {
        if self.is_store_path(path) {
            Ok(())
        } else {
            Err(StorePathError::NotInStore(path.to_owned()))
        }
    }

    /// Truncate `path` to the top-level store entry containing it.
    pub fn to_store_path(&self, path: &Path) -> Result<PathBuf, StorePathError> {
        if !self.is_in_store(path) {
            return Err(StorePathError::NotInStore(path.to_owned()));
        }
        let s = path.to_str().expect("checked by is_in_store");
        match s[self.path.len() + 1..].find('/') {
            None => Ok(path.to_owned()),
            Some(slash) => Ok(PathBuf::from(&s[..self.path.len() + 1 + slash])),
        }
    }

    /// Compute a store path from a type tag, a content hash and a suffix,
    /// e.g. `make_store_path("source", h, "foo.tar.gz")`.
    ///
    /// The descriptor is `"<type>:sha256:<hex>:<root>:<suffix>"`; its SHA-256
    /// is folded to 20 bytes and rendered in nix-base32.  Deterministic
    /// bit-for-bit over its inputs.
    pub fn make_store_path(&self, type_: &str, hash: &Hash, suffix: &str) -> PathBuf {
        let descriptor = format!("{}:sha256:{}:{}:{}", type_, hash.to_hex(), self.path, suffix);
        let digest = Algorithm::Sha256.digest(&descriptor).compress(20);
        PathBuf::from(format!(
            "{}/{}-{}",
            self.path,
            to_nix_base32(&digest),
            suffix
        ))
    }

    /// The digest component of a store path's base name, if it has one.
    /// This is the needle the reference scanner searches for.
    pub fn hash_part(&self, path: &Path) -> Option<String> {
        if !self.is_store_path(path) {
            return None;
        }
        let base = path.file_name()?.to_str()?;
        let digest = base.get(..DIGEST_LEN)?;
        if base.as_bytes().get(DIGEST_LEN) != Some(&b'-') {
            return None;
        }
        if !digest.bytes().all(is_base32_char) {
            return None;
        }
        Some(digest.to_owned())
    }
}
