// SPDX-License-Identifier: MIT

//! Streaming reference scanner.
//!
//! After a build the engine must discover which store paths the output
//! embeds.  Rather than grepping for each candidate path separately, the
//! scanner slides a 32-byte window over the byte stream and validates it
//! right-to-left against the nix-base32 alphabet; an invalid character at
//! offset j lets it skip j+1 positions at once, so binary data is scanned
//! in O(n/32) amortised.  Valid windows are looked up in a hash set of the
//! candidates' digest components.
//!
//! The scanner is push-based: the dump stream that computes the content
//! hash feeds the same chunks here, so one disk pass produces both the hash
//! and the reference set.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;

use quern_store_core::store_path::{PathSet, StoreDir, DIGEST_LEN};

/// 256-byte lookup table for the nix-base32 alphabet.
const VALID: [bool; 256] = {
    let mut table = [false; 256];
    let chars = b"0123456789abcdfghijklmnpqrsvwxyz";
    let mut i = 0;
    while i < chars.len() {
        table[chars[i] as usize] = true;
        i += 1;
    }
    table
};

/// Finds candidate store path digests in a byte stream.
pub struct RefScanSink {
    /// Digests still being looked for (moved to `seen` on first match).
    pending: HashSet<[u8; DIGEST_LEN]>,
    seen: HashSet<[u8; DIGEST_LEN]>,
    /// Digest → candidate path, for result construction.
    back_map: HashMap<[u8; DIGEST_LEN], PathBuf>,
    /// Tail of the previous chunk, for matches spanning a boundary.
    tail: Vec<u8>,
}

impl RefScanSink {
    /// Scan for the digest components of `candidates`.  Candidates without
    /// a digest-shaped base name are ignored.
    pub fn new(store_dir: &StoreDir, candidates: &PathSet) -> Self {
        let mut pending = HashSet::with_capacity(candidates.len());
        let mut back_map = HashMap::with_capacity(candidates.len());

        for path in candidates {
            let Some(digest) = store_dir.hash_part(path) else {
                continue;
            };
            let mut key = [0u8; DIGEST_LEN];
            key.copy_from_slice(digest.as_bytes());
            pending.insert(key);
            back_map.insert(key, path.clone());
        }

        RefScanSink {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(DIGEST_LEN),
        }
    }

    /// Feed a chunk of bytes.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(DIGEST_LEN);

        // Overlap region: old tail + start of new data.
        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        // Keep at most DIGEST_LEN trailing bytes for the next boundary.
        let rest = DIGEST_LEN - tail_len;
        if rest < self.tail.len() {
            self.tail.drain(..self.tail.len() - rest);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    /// The candidate paths whose digests were found.
    pub fn found_paths(&self) -> PathSet {
        self.back_map
            .iter()
            .filter(|(digest, _)| self.seen.contains(*digest))
            .map(|(_, path)| path.clone())
            .collect()
    }
}

impl Write for RefScanSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn search(
    data: &[u8],
    pending: &mut HashSet<[u8; DIGEST_LEN]>,
    seen: &mut HashSet<[u8; DIGEST_LEN]>,
) {
    if data.len() < DIGEST_LEN {
        return;
    }

    let mut i = 0;
    while i + DIGEST_LEN <= data.len() {
        // Validate the window right-to-left; skip past the rightmost
        // invalid character.
        let mut j = DIGEST_LEN;
        let mut skipped = false;
        while j > 0 {
            j -= 1;
            if !VALID[data[i + j] as usize] {
                i += j + 1;
                skipped = true;
                break;
            }
        }
        if skipped {
            continue;
        }

        let window: [u8; DIGEST_LEN] = data[i..i + DIGEST_LEN]
            .try_into()
            .expect("window length matches DIGEST_LEN");
        if pending.remove(&window) {
            seen.insert(window);
        }

        i += 1;
    }
}
