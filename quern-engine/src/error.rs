// SPDX-License-Identifier: MIT

//! Engine error taxonomy.
//!
//! `Build` and `Subst` are the two kinds with non-fatal handling: a build
//! failure completes its goal unsuccessfully (other goals continue under
//! `keep_going`), and a substitute failure only advances the substitution
//! goal to its next candidate.  Everything else unwinds through the worker.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed invocation; surface and exit.
    #[error("{0}")]
    Usage(String),

    /// An OS call failed; carries context.
    #[error("{message}: {source}")]
    Sys {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Database failure.
    #[error("store database error: {0}")]
    Db(#[from] quern_store_db::Error),

    /// A local build failed (bad platform, builder exit, missing output,
    /// hash mismatch).  Caught inside the derivation goal.
    #[error("{0}")]
    Build(String),

    /// A single substitute failed; the substitution goal tries the next one.
    #[error("{0}")]
    Subst(String),

    /// A store path failed validation.
    #[error(transparent)]
    StorePath(#[from] quern_store_core::StorePathError),

    /// A derivation or legacy closure file failed to parse.
    #[error("cannot parse '{path}': {source}")]
    BadTerm {
        path: PathBuf,
        #[source]
        source: quern_store_core::derivation::ATermError,
    },

    /// The worker wire protocol was violated by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The process-wide interrupt flag was observed.
    #[error("interrupted by the user")]
    Interrupted,

    /// Everything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn build(message: impl Into<String>) -> Self {
        Error::Build(message.into())
    }

    pub fn subst(message: impl Into<String>) -> Self {
        Error::Subst(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Error::Other(message.into())
    }
}

/// Helper trait for adding context to IO errors.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Sys {
            message: f(),
            source: e,
        })
    }
}

impl<T> IoContext<T> for nix::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Sys {
            message: f(),
            source: std::io::Error::from_raw_os_error(e as i32),
        })
    }
}
