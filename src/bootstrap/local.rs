//! Local transport: fork-and-exec the peer binary directly on this host
//! (spec §4.6, §6 `local { python_path, remote_name }`).

use std::os::unix::process::CommandExt as _;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::Transport;
use crate::error::{Error, Result};

/// Spawns a child `relaymux` process on the local machine.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    /// Path to the peer binary (spec §6 names this field `python_path`;
    /// kept for config-shape fidelity — see the `bootstrap` module docs
    /// for why it now names this binary rather than an interpreter).
    pub python_path: std::path::PathBuf,
    /// Name used in `argv[0]` and peer naming (spec §6: `local.<pid>`
    /// once a pid is known; `remote_name` lets a caller override it).
    pub remote_name: Option<String>,
}

impl LocalTransport {
    /// A local transport spawning `python_path` with no name override.
    #[must_use]
    pub fn new(python_path: impl Into<std::path::PathBuf>) -> Self {
        Self { python_path: python_path.into(), remote_name: None }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn peer_name(&self) -> String {
        match &self.remote_name {
            Some(n) => n.clone(),
            None => format!("local.{}", std::process::id()),
        }
    }

    async fn spawn(&self) -> Result<Child> {
        let name = self.peer_name();
        let mut cmd = Command::new(&self.python_path);
        cmd.arg0(format!("relaymux:{name}"));
        cmd.arg("--stage1");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.spawn().map_err(|e| Error::Bootstrap(format!("spawning local peer {name}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_name_defaults_to_local_pid() {
        let t = LocalTransport::new("/usr/bin/relaymux");
        assert!(t.peer_name().starts_with("local."));
    }

    #[test]
    fn peer_name_honors_override() {
        let mut t = LocalTransport::new("/usr/bin/relaymux");
        t.remote_name = Some("local.custom".into());
        assert_eq!(t.peer_name(), "local.custom");
    }
}
