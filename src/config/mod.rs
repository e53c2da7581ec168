//! User configuration loaded from `$XDG_CONFIG_HOME/spito/config.toml`.
pub mod toml_loader;

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
///
/// Every field is optional in the file; missing fields fall back to the XDG
/// defaults computed by [`SpitoConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpitoConfig {
    /// Revert batches and the environment ledger live here.
    pub state_dir: PathBuf,
    /// Fetched rule collections, one directory per canonical identifier.
    pub rulesets_dir: PathBuf,
    /// Parent of the per-session overlay and staging directories.
    pub scratch_dir: PathBuf,
    /// Host prepended to bare `owner/name` identifiers.
    pub default_host: String,
    /// Hard limit for a single daemon query.
    pub daemon_timeout_secs: u64,
}

impl Default for SpitoConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from);
        let data = xdg_dir("XDG_DATA_HOME", &home, ".local/share");
        let cache = xdg_dir("XDG_CACHE_HOME", &home, ".cache");
        Self {
            state_dir: data.join("spito"),
            rulesets_dir: cache.join("spito").join("rulesets"),
            scratch_dir: std::env::temp_dir(),
            default_host: "github.com".to_string(),
            daemon_timeout_secs: 10,
        }
    }
}

impl SpitoConfig {
    /// Load the configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from);
        let path = xdg_dir("XDG_CONFIG_HOME", &home, ".config")
            .join("spito")
            .join("config.toml");
        Self::load_from(&path)
    }

    /// Load the configuration from `path`; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        toml_loader::load_config(path)
    }

    /// Configuration rooted entirely under `root`, for isolated runs.
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            rulesets_dir: root.join("rulesets"),
            scratch_dir: root.join("scratch"),
            ..Self::default()
        }
    }

    /// Daemon query timeout as a [`Duration`].
    #[must_use]
    pub const fn daemon_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon_timeout_secs)
    }
}

fn xdg_dir(var: &str, home: &Path, fallback: &str) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map_or_else(|| home.join(fallback), PathBuf::from)
}
