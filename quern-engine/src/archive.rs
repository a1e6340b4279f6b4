// SPDX-License-Identifier: MIT

//! Deterministic tree serialisation (dump) and its inverse (restore).
//!
//! The format is the Nix archive layout: length-prefixed strings padded to
//! 8 bytes, nodes bracketed by `(`/`)` tokens, directory entries emitted in
//! sorted order, and only three node types (regular file with optional
//! executable bit, symlink, directory).  Everything that makes two equal
//! trees hash differently on ordinary filesystems (timestamps, ownership,
//! entry order) is absent from the stream, which is what makes
//! `hash_path` usable as a content address.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use quern_store_core::hash::{Algorithm, Context, Hash};

const ARCHIVE_MAGIC: &str = "nix-archive-1";

/// Serialise the tree at `path` into `sink`.
pub fn dump_path(path: &Path, sink: &mut impl Write) -> io::Result<()> {
    write_str(sink, ARCHIVE_MAGIC)?;
    dump_node(path, sink)
}

/// Hash the serialised tree at `path` (the content address of a store
/// object).
pub fn hash_path(path: &Path) -> io::Result<Hash> {
    let mut sink = HashingWriter {
        ctx: Context::new(Algorithm::Sha256),
    };
    dump_path(path, &mut sink)?;
    Ok(sink.ctx.finish())
}

/// Hash the raw bytes of a single file (used for fixed-output checks, where
/// the declared digest is over the file contents, not the archive).
pub fn hash_file(algorithm: Algorithm, path: &Path) -> io::Result<Hash> {
    let mut ctx = Context::new(algorithm);
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(ctx.finish())
}

/// Rebuild a tree at `path` from a dump stream.  `path` must not exist.
pub fn restore_path(path: &Path, source: &mut impl Read) -> io::Result<()> {
    let magic = read_str(source)?;
    if magic != ARCHIVE_MAGIC {
        return Err(bad_archive(format!("bad archive magic '{magic}'")));
    }
    restore_node(path, source)
}

struct HashingWriter {
    ctx: Context,
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Dump ────────────────────────────────────────────────────────────────────

fn dump_node(path: &Path, sink: &mut impl Write) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    write_str(sink, "(")?;
    write_str(sink, "type")?;

    if meta.is_symlink() {
        write_str(sink, "symlink")?;
        write_str(sink, "target")?;
        let target = fs::read_link(path)?;
        write_bytes(sink, target.to_string_lossy().as_bytes())?;
    } else if meta.is_file() {
        write_str(sink, "regular")?;
        if meta.permissions().mode() & 0o100 != 0 {
            write_str(sink, "executable")?;
            write_str(sink, "")?;
        }
        write_str(sink, "contents")?;
        write_file_contents(sink, path, meta.len())?;
    } else if meta.is_dir() {
        write_str(sink, "directory")?;
        let mut names: Vec<_> = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<_>>()?;
        names.sort();
        for name in names {
            write_str(sink, "entry")?;
            write_str(sink, "(")?;
            write_str(sink, "name")?;
            write_bytes(sink, name.to_string_lossy().as_bytes())?;
            write_str(sink, "node")?;
            dump_node(&path.join(&name), sink)?;
            write_str(sink, ")")?;
        }
    } else {
        return Err(bad_archive(format!(
            "path '{}' has an unsupported file type",
            path.display()
        )));
    }

    write_str(sink, ")")
}

fn write_file_contents(sink: &mut impl Write, path: &Path, len: u64) -> io::Result<()> {
    sink.write_all(&len.to_le_bytes())?;
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 65536];
    let mut written: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        written += n as u64;
        sink.write_all(&buf[..n])?;
    }
    if written != len {
        return Err(bad_archive(format!(
            "file '{}' changed size while dumping it",
            path.display()
        )));
    }
    write_padding(sink, len)
}

fn write_str(sink: &mut impl Write, s: &str) -> io::Result<()> {
    write_bytes(sink, s.as_bytes())
}

fn write_bytes(sink: &mut impl Write, data: &[u8]) -> io::Result<()> {
    sink.write_all(&(data.len() as u64).to_le_bytes())?;
    sink.write_all(data)?;
    write_padding(sink, data.len() as u64)
}

fn write_padding(sink: &mut impl Write, len: u64) -> io::Result<()> {
    let pad = (8 - len % 8) % 8;
    if pad > 0 {
        sink.write_all(&[0u8; 8][..pad as usize])?;
    }
    Ok(())
}

// ── Restore ─────────────────────────────────────────────────────────────────

fn restore_node(path: &Path, source: &mut impl Read) -> io::Result<()> {
    expect_str(source, "(")?;
    expect_str(source, "type")?;
    let node_type = read_str(source)?;

    match node_type.as_str() {
        "symlink" => {
            expect_str(source, "target")?;
            let target = read_str(source)?;
            std::os::unix::fs::symlink(&target, path)?;
            expect_str(source, ")")?;
        }
        "regular" => {
            let mut token = read_str(source)?;
            let mut executable = false;
            if token == "executable" {
                executable = true;
                expect_str(source, "")?;
                token = read_str(source)?;
            }
            if token != "contents" {
                return Err(bad_archive(format!("expected 'contents', got '{token}'")));
            }
            restore_file_contents(path, source, executable)?;
            expect_str(source, ")")?;
        }
        "directory" => {
            fs::create_dir(path)?;
            loop {
                let token = read_str(source)?;
                match token.as_str() {
                    ")" => break,
                    "entry" => {
                        expect_str(source, "(")?;
                        expect_str(source, "name")?;
                        let name = read_str(source)?;
                        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                            return Err(bad_archive(format!("invalid entry name '{name}'")));
                        }
                        expect_str(source, "node")?;
                        restore_node(&path.join(&name), source)?;
                        expect_str(source, ")")?;
                    }
                    other => {
                        return Err(bad_archive(format!("unexpected token '{other}'")));
                    }
                }
            }
        }
        other => {
            return Err(bad_archive(format!("unknown node type '{other}'")));
        }
    }

    Ok(())
}

fn restore_file_contents(path: &Path, source: &mut impl Read, executable: bool) -> io::Result<()> {
    let len = read_u64(source)?;
    let mut file = fs::File::create(path)?;
    let mut remaining = len;
    let mut buf = [0u8; 65536];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        source.read_exact(&mut buf[..chunk])?;
        file.write_all(&buf[..chunk])?;
        remaining -= chunk as u64;
    }
    skip_padding(source, len)?;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn read_u64(source: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_str(source: &mut impl Read) -> io::Result<String> {
    let len = read_u64(source)?;
    if len > 64 * 1024 * 1024 {
        return Err(bad_archive(format!("string of {len} bytes is implausible")));
    }
    let mut data = vec![0u8; len as usize];
    source.read_exact(&mut data)?;
    skip_padding(source, len)?;
    String::from_utf8(data).map_err(|_| bad_archive("string is not UTF-8".to_string()))
}

fn expect_str(source: &mut impl Read, expected: &str) -> io::Result<()> {
    let got = read_str(source)?;
    if got != expected {
        return Err(bad_archive(format!("expected '{expected}', got '{got}'")));
    }
    Ok(())
}

fn skip_padding(source: &mut impl Read, len: u64) -> io::Result<()> {
    let pad = (8 - len % 8) % 8;
    if pad > 0 {
        let mut buf = [0u8; 8];
        source.read_exact(&mut buf[..pad as usize])?;
        if buf[..pad as usize].iter().any(|&b| b != 0) {
            return Err(bad_archive("non-zero padding".to_string()));
        }
    }
    Ok(())
}

fn bad_archive(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tree(root: &Path) {
        fs::create_dir(root).unwrap();
        fs::write(root.join("plain.txt"), "plain contents\n").unwrap();
        fs::write(root.join("tool"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(root.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/inner"), b"\x00\x01binary\xff").unwrap();
        std::os::unix::fs::symlink("plain.txt", root.join("link")).unwrap();
    }

    #[test]
    fn test_dump_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        build_tree(&src);

        let mut dump = Vec::new();
        dump_path(&src, &mut dump).unwrap();

        let dst = dir.path().join("dst");
        restore_path(&dst, &mut dump.as_slice()).unwrap();

        assert_eq!(
            fs::read(dst.join("plain.txt")).unwrap(),
            b"plain contents\n"
        );
        assert_eq!(fs::read(dst.join("sub/inner")).unwrap(), b"\x00\x01binary\xff");
        assert!(fs::metadata(dst.join("tool")).unwrap().permissions().mode() & 0o100 != 0);
        assert_eq!(
            fs::read_link(dst.join("link")).unwrap(),
            Path::new("plain.txt")
        );

        // The restored tree serialises identically.
        let mut dump2 = Vec::new();
        dump_path(&dst, &mut dump2).unwrap();
        assert_eq!(dump, dump2);
    }

    #[test]
    fn test_hash_ignores_metadata_noise() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        build_tree(&a);
        build_tree(&b);
        assert_eq!(hash_path(&a).unwrap(), hash_path(&b).unwrap());

        fs::write(b.join("plain.txt"), "different\n").unwrap();
        assert_ne!(hash_path(&a).unwrap(), hash_path(&b).unwrap());
    }

    #[test]
    fn test_single_file_dump() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, "hi\n").unwrap();

        let mut dump = Vec::new();
        dump_path(&f, &mut dump).unwrap();
        let g = dir.path().join("g");
        restore_path(&g, &mut dump.as_slice()).unwrap();
        assert_eq!(fs::read(&g).unwrap(), b"hi\n");
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst");
        let mut garbage: &[u8] = b"definitely not an archive";
        assert!(restore_path(&dst, &mut garbage).is_err());
    }

    #[test]
    fn test_hash_file_flat() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, "abc").unwrap();
        assert_eq!(
            hash_file(Algorithm::Sha256, &f).unwrap().to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
