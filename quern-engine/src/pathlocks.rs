// SPDX-License-Identifier: MIT

//! Cross-process advisory locks over store paths.
//!
//! Each store path `<path>` is protected by an exclusive `flock()` on
//! `<path>.lock`, so cooperating engine processes can build concurrently
//! without trampling each other's outputs.  Locks are taken in sorted path
//! order to rule out deadlock between two processes locking overlapping
//! sets, and released (optionally deleting the lock files) on drop.
//!
//! Once a path has become valid it is safe to delete its lock file: future
//! lockers open a fresh inode, observe validity after acquiring it, and
//! back off.
//!
//! A process-global registry refuses to lock a path this process already
//! holds; with a single worker per process that is always a programming
//! error rather than contention.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{Error, Result};

static HELD_LOCKS: Mutex<Option<HashSet<PathBuf>>> = Mutex::new(None);

fn register_held(path: &Path) -> bool {
    let mut held = HELD_LOCKS.lock().expect("lock registry poisoned");
    held.get_or_insert_with(HashSet::new).insert(path.to_owned())
}

fn unregister_held(path: &Path) {
    let mut held = HELD_LOCKS.lock().expect("lock registry poisoned");
    if let Some(set) = held.as_mut() {
        set.remove(path);
    }
}

struct HeldLock {
    flock: Option<Flock<File>>,
    path: PathBuf,
    lock_path: PathBuf,
}

/// A set of exclusive locks over store paths.
#[derive(Default)]
pub struct PathLocks {
    locks: Vec<HeldLock>,
    delete_on_release: bool,
}

impl PathLocks {
    pub fn new() -> Self {
        PathLocks::default()
    }

    /// Acquire exclusive locks on `<path>.lock` for every path, in sorted
    /// order.  Blocks until all locks are held.
    pub fn lock_paths(&mut self, paths: &[PathBuf]) -> Result<()> {
        assert!(self.locks.is_empty(), "PathLocks may only be used once");

        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        for path in sorted {
            if !register_held(path) {
                return Err(Error::other(format!(
                    "deadlock: trying to re-lock path '{}' already held by this process",
                    path.display()
                )));
            }

            let lock_path = PathBuf::from(format!("{}.lock", path.display()));
            debug!("locking path '{}'", path.display());

            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
            {
                Ok(file) => file,
                Err(e) => {
                    unregister_held(path);
                    return Err(Error::Sys {
                        message: format!("opening lock file '{}'", lock_path.display()),
                        source: e,
                    });
                }
            };

            let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                unregister_held(path);
                Error::Sys {
                    message: format!("locking '{}'", lock_path.display()),
                    source: io::Error::from_raw_os_error(errno as i32),
                }
            })?;

            self.locks.push(HeldLock {
                flock: Some(flock),
                path: path.clone(),
                lock_path,
            });
        }

        Ok(())
    }

    /// Delete the lock files after the locks are released.
    pub fn set_deletion(&mut self, delete: bool) {
        self.delete_on_release = delete;
    }
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        for lock in &mut self.locks {
            if self.delete_on_release {
                // Unlink before releasing: a blocked locker that proceeds on
                // the old inode will re-check path validity anyway.
                let _ = std::fs::remove_file(&lock.lock_path);
            }
            debug!("releasing lock on '{}'", lock.path.display());
            lock.flock.take();
            unregister_held(&lock.path);
        }
    }
}
