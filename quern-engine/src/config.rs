// SPDX-License-Identifier: MIT

//! Engine configuration.
//!
//! A settings record is built once at startup from an optional TOML file
//! plus environment overrides, then passed by reference everywhere; nothing
//! re-reads the environment after that.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoContext, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// The store root; every store path begins with it.
    pub store_dir: PathBuf,

    /// State directory holding the database and the daemon socket.
    pub state_dir: PathBuf,

    /// Directory for per-derivation build logs.
    pub log_dir: PathBuf,

    /// Bound on concurrently running build slots.
    pub max_build_jobs: u32,

    /// External program consulted before every local build; unset means
    /// always build locally.
    pub build_hook: Option<PathBuf>,

    /// Keep realising other goals after a failure.
    pub keep_going: bool,

    /// Fall back to a local build when substitutes fail.
    pub try_fallback: bool,

    /// Keep the temporary build directory of failed builds.
    pub keep_failed: bool,

    /// Never write to the store or the database.
    pub read_only: bool,

    /// Platform identifier builds must match, e.g. `x86_64-linux`.
    pub this_system: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/nix/store"),
            state_dir: PathBuf::from("/nix/var/nix"),
            log_dir: PathBuf::from("/nix/var/log/nix"),
            max_build_jobs: 1,
            build_hook: None,
            keep_going: false,
            try_fallback: false,
            keep_failed: false,
            read_only: false,
            this_system: default_system(),
        }
    }
}

fn default_system() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&contents).map_err(|e| Error::Usage(format!("bad config file: {e}")))
    }

    /// Load the file named by `QUERND_CONFIG` (defaults otherwise), then
    /// apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut settings = match std::env::var_os("QUERND_CONFIG") {
            Some(path) => Settings::from_file(Path::new(&path))?,
            None => Settings::default(),
        };

        if let Some(v) = std::env::var_os("NIX_STORE_DIR") {
            settings.store_dir = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("NIX_STATE_DIR") {
            settings.state_dir = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("NIX_LOG_DIR") {
            settings.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NIX_MAX_BUILD_JOBS") {
            settings.max_build_jobs = v
                .parse()
                .map_err(|_| Error::Usage(format!("NIX_MAX_BUILD_JOBS: '{v}' is not a number")))?;
        }
        if let Some(v) = std::env::var_os("NIX_BUILD_HOOK") {
            settings.build_hook = Some(PathBuf::from(v));
        }
        settings.keep_going |= env_flag("NIX_KEEP_GOING");
        settings.try_fallback |= env_flag("NIX_TRY_FALLBACK");
        settings.keep_failed |= env_flag("NIX_KEEP_FAILED");
        settings.read_only |= env_flag("NIX_READ_ONLY");

        Ok(settings)
    }

    /// Database directory, `<state_dir>/db`.
    pub fn db_dir(&self) -> PathBuf {
        self.state_dir.join("db")
    }

    /// Daemon socket path, `<state_dir>/daemon.socket`.
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join("daemon.socket")
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.db_dir(), PathBuf::from("/nix/var/nix/db"));
        assert_eq!(s.max_build_jobs, 1);
        assert!(!s.keep_going);
        assert!(s.this_system.contains('-'));
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quernd.toml");
        std::fs::write(
            &path,
            r#"
            store_dir = "/tmp/store"
            max_build_jobs = 4
            keep_going = true
            "#,
        )
        .unwrap();
        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.store_dir, PathBuf::from("/tmp/store"));
        assert_eq!(s.max_build_jobs, 4);
        assert!(s.keep_going);
        // Unspecified fields keep their defaults.
        assert_eq!(s.log_dir, PathBuf::from("/nix/var/log/nix"));
    }
}
