//! Ambient master-side configuration. Not part of the wire protocol —
//! purely local settings for how *this* master behaves when it
//! bootstraps peers, loaded from a per-user settings file the same way
//! any long-running CLI daemon keeps its local preferences.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::DEFAULT_BOOTSTRAP_DEADLINE;
use crate::broker::DEFAULT_SHUTDOWN_TIMEOUT;

/// Master-side settings, loaded from `~/.config/relaymux/config.json` (or
/// `RELAYMUX_CONFIG_DIR` when set, for running multiple configurations
/// side by side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-sentinel bootstrap timeout, in seconds (spec §4.6).
    pub bootstrap_deadline_secs: u64,
    /// Grace period given to streams to drain before a forced disconnect
    /// during shutdown (spec §4.2/§4.7).
    pub shutdown_grace_secs: u64,
    /// Default `ssh` binary, overridable per-`SshTransport`.
    pub ssh_path: PathBuf,
    /// Default `sudo` binary, overridable per-`SudoTransport`.
    pub sudo_path: PathBuf,
    /// Default identity file for SSH transports that don't set their own.
    pub identity_file: Option<PathBuf>,
    /// `RUST_LOG`-style directive forwarded to bootstrapped peers.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap_deadline_secs: DEFAULT_BOOTSTRAP_DEADLINE.as_secs(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            ssh_path: PathBuf::from("ssh"),
            sudo_path: PathBuf::from("sudo"),
            identity_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Directory config is read from/written to.
    #[must_use]
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("RELAYMUX_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("relaymux")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from the default path, falling back to defaults if the file is
    /// missing (first run).
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, for tests and overrides.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persist to the default path, creating parent directories as needed.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Convenience accessor used by bootstrap callers.
    #[must_use]
    pub fn bootstrap_deadline(&self) -> Duration {
        Duration::from_secs(self.bootstrap_deadline_secs)
    }

    /// Convenience accessor used by shutdown callers.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("nonexistent.json")).unwrap();
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = Config::default();
        cfg.log_level = "debug".into();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        let back = Config::load_from(&path).unwrap();
        assert_eq!(back.log_level, "debug");
    }
}
