//! Substitute records: external program invocations that can materialise a
//! store path without a local build.

use std::path::PathBuf;

use crate::strings::{pack_strings, unpack_strings};

/// On-disk encoding version of a substitute record.
pub const SUBSTITUTE_VERSION: u32 = 2;

/// A registered way to produce a store path: run `program` with the target
/// path and `args`.  `deriver` records which derivation the substituted
/// artifact originally came from.
#[derive(Debug, Clone, Eq)]
pub struct Substitute {
    pub deriver: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Two substitutes are the same invocation; the deriver is provenance, not
/// identity.
impl PartialEq for Substitute {
    fn eq(&self, other: &Self) -> bool {
        self.program == other.program && self.args == other.args
    }
}

impl Substitute {
    /// Encode as a packed string tagged with [`SUBSTITUTE_VERSION`].
    pub fn encode(&self) -> String {
        pack_strings([
            SUBSTITUTE_VERSION.to_string(),
            self.deriver.to_string_lossy().into_owned(),
            self.program.to_string_lossy().into_owned(),
            pack_strings(&self.args),
        ])
    }

    /// Decode a packed substitute.  Returns `None` for malformed entries and
    /// for entries written by an unknown encoding version; readers skip
    /// those rather than fail.
    pub fn decode(packed: &str) -> Option<Substitute> {
        let fields = unpack_strings(packed)?;
        if fields.len() != 4 {
            return None;
        }
        let version: u32 = fields[0].parse().ok()?;
        if version != SUBSTITUTE_VERSION {
            return None;
        }
        Some(Substitute {
            deriver: PathBuf::from(&fields[1]),
            program: PathBuf::from(&fields[2]),
            args: unpack_strings(&fields[3])?,
        })
    }
}
