// SPDX-License-Identifier: MIT

//! The worker wire protocol, served by the out-of-process daemon variant.
//!
//! Framing: unsigned 64-bit little-endian integers; strings are a length
//! followed by the bytes, padded with zeros to an 8-byte boundary.  A
//! connection starts with a magic-word handshake, then carries one framed
//! operation code per request.  Unknown operations are fatal for the
//! connection.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, IoContext, Result};
use crate::interrupt::check_interrupt;
use crate::store::Store;

pub const WORKER_MAGIC_1: u64 = 0x6e697864;
pub const WORKER_MAGIC_2: u64 = 0x6478696e;

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOp {
    Quit = 0,
    IsValidPath = 1,
    QuerySubstitutes = 2,
}

impl WorkerOp {
    fn from_u64(op: u64) -> Option<WorkerOp> {
        match op {
            0 => Some(WorkerOp::Quit),
            1 => Some(WorkerOp::IsValidPath),
            2 => Some(WorkerOp::QuerySubstitutes),
            _ => None,
        }
    }
}

// ── Framing primitives ──────────────────────────────────────────────────────

pub fn write_u64(w: &mut impl Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())
        .io_context(|| "writing to the client".to_string())
}

pub fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .io_context(|| "reading from the client".to_string())?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_string(w: &mut impl Write, s: &str) -> Result<()> {
    write_u64(w, s.len() as u64)?;
    w.write_all(s.as_bytes())
        .io_context(|| "writing to the client".to_string())?;
    let pad = (8 - s.len() % 8) % 8;
    if pad > 0 {
        w.write_all(&[0u8; 8][..pad])
            .io_context(|| "writing to the client".to_string())?;
    }
    Ok(())
}

pub fn read_string(r: &mut impl Read) -> Result<String> {
    let len = read_u64(r)?;
    if len > 1024 * 1024 {
        return Err(Error::Protocol(format!("string of {len} bytes refused")));
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data)
        .io_context(|| "reading from the client".to_string())?;
    let pad = (8 - len % 8) % 8;
    if pad > 0 {
        let mut padding = [0u8; 8];
        r.read_exact(&mut padding[..pad as usize])
            .io_context(|| "reading from the client".to_string())?;
    }
    String::from_utf8(data).map_err(|_| Error::Protocol("string is not UTF-8".into()))
}

// ── Server ──────────────────────────────────────────────────────────────────

/// Serve one client connection: handshake, then an operation loop until
/// `Quit` or EOF.
pub fn serve_connection(store: &Store, stream: &mut UnixStream) -> Result<()> {
    let magic = read_u64(stream)?;
    if magic != WORKER_MAGIC_1 {
        return Err(Error::Protocol(format!("bad client magic {magic:#x}")));
    }
    write_u64(stream, WORKER_MAGIC_2)?;

    loop {
        check_interrupt()?;

        let op = match read_u64(stream) {
            Ok(op) => op,
            // EOF between operations is a normal disconnect.
            Err(Error::Sys { source, .. })
                if source.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match WorkerOp::from_u64(op) {
            Some(WorkerOp::Quit) => {
                debug!("client quit");
                return Ok(());
            }
            Some(WorkerOp::IsValidPath) => {
                let path = PathBuf::from(read_string(stream)?);
                let valid = store.is_valid_path(&path);
                write_u64(stream, valid as u64)?;
            }
            Some(WorkerOp::QuerySubstitutes) => {
                let path = PathBuf::from(read_string(stream)?);
                let subs = store.query_substitutes(&path)?;
                write_u64(stream, subs.len() as u64)?;
                for sub in subs {
                    write_string(stream, &sub.deriver.to_string_lossy())?;
                    write_string(stream, &sub.program.to_string_lossy())?;
                    write_u64(stream, sub.args.len() as u64)?;
                    for arg in &sub.args {
                        write_string(stream, arg)?;
                    }
                }
            }
            None => {
                return Err(Error::Protocol(format!("unknown operation {op}")));
            }
        }
    }
}

/// Accept loop over the daemon socket.  Connections are handled one at a
/// time; the engine itself is single-threaded.
pub fn serve(store: &Store, socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .io_context(|| format!("removing stale socket '{}'", socket_path.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .io_context(|| format!("binding '{}'", socket_path.display()))?;
    info!("listening on '{}'", socket_path.display());

    loop {
        check_interrupt()?;
        let (mut stream, _addr) = listener
            .accept()
            .io_context(|| "accepting a connection".to_string())?;
        if let Err(e) = serve_connection(store, &mut stream) {
            match e {
                Error::Interrupted => return Err(e),
                other => warn!("connection failed: {other}"),
            }
        }
    }
}

// ── Client helpers (used by tests and simple tooling) ───────────────────────

/// Perform the client side of the handshake.
pub fn client_handshake(stream: &mut UnixStream) -> Result<()> {
    write_u64(stream, WORKER_MAGIC_1)?;
    let magic = read_u64(stream)?;
    if magic != WORKER_MAGIC_2 {
        return Err(Error::Protocol(format!("bad server magic {magic:#x}")));
    }
    Ok(())
}
