// SPDX-License-Identifier: MIT

//! Store path metadata canonicalisation.
//!
//! Everything registered in the store gets the same metadata: mode `0444`
//! (or `0555` when any execute bit was set), mtime 0, ownership of the
//! running process.  Symlinks are skipped; they carry no independent
//! permissions or timestamps.  Idempotent.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use nix::unistd::{getgid, getuid};

use crate::error::{IoContext, Result};
use crate::interrupt::check_interrupt;

/// Zero atime/mtime on `path` without following symlinks.
#[allow(unsafe_code)]
fn zero_timestamps(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let epoch = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let times = [epoch; 2];
    // SAFETY: `c_path` and `times` are live locals for the duration of the
    // call, and AT_SYMLINK_NOFOLLOW makes the syscall act on the entry
    // itself, never on a link target.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Canonicalise all metadata under `path` recursively.
pub fn canonicalise_path_metadata(path: &Path) -> Result<()> {
    check_interrupt()?;

    let meta = fs::symlink_metadata(path)
        .io_context(|| format!("getting attributes of path '{}'", path.display()))?;

    if !meta.is_symlink() {
        let mode = meta.permissions().mode() & 0o7777;
        if mode != 0o444 && mode != 0o555 {
            let new_mode = 0o444 | if mode & 0o100 != 0 { 0o111 } else { 0 };
            fs::set_permissions(path, fs::Permissions::from_mode(new_mode))
                .io_context(|| format!("changing mode of '{}'", path.display()))?;
        }

        let (uid, gid) = (getuid(), getgid());
        if meta.uid() != uid.as_raw() || meta.gid() != gid.as_raw() {
            nix::unistd::chown(path, Some(uid), Some(gid))
                .io_context(|| format!("changing owner/group of '{}'", path.display()))?;
        }

        if meta.mtime() != 0 {
            zero_timestamps(path)
                .io_context(|| format!("changing modification time of '{}'", path.display()))?;
        }
    }

    if meta.is_dir() {
        for entry in fs::read_dir(path)
            .io_context(|| format!("reading directory '{}'", path.display()))?
        {
            let entry = entry.io_context(|| format!("reading directory '{}'", path.display()))?;
            canonicalise_path_metadata(&entry.path())?;
        }
    }

    Ok(())
}
