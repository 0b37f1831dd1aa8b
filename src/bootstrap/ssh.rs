//! SSH transport (spec §4.6, §6 `ssh { hostname, username, port, ssh_path,
//! identity_file, password, check_host_keys }`).

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use super::Transport;
use crate::error::{Error, Result};

/// Spawns the system `ssh` client and drives its password/host-key
/// prompts.
#[derive(Debug, Clone)]
pub struct SshTransport {
    /// Target host.
    pub hostname: String,
    /// Remote account, if not the current user.
    pub username: Option<String>,
    /// Remote port, if not 22.
    pub port: Option<u16>,
    /// Path to the peer binary on the remote host.
    pub python_path: std::path::PathBuf,
    /// Path to the `ssh` client binary.
    pub ssh_path: std::path::PathBuf,
    /// `-i` identity file.
    pub identity_file: Option<std::path::PathBuf>,
    /// Password to answer an interactive prompt with, if any.
    pub password: Option<String>,
    /// When false, passes `-o StrictHostKeyChecking=no`.
    pub check_host_keys: bool,
    password_sent: bool,
}

impl SshTransport {
    /// An SSH transport with host-key checking enabled and no stored
    /// password (the common case; hosts not yet in `known_hosts` should
    /// opt out explicitly via `check_host_keys = false`).
    #[must_use]
    pub fn new(hostname: impl Into<String>, python_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            hostname: hostname.into(),
            username: None,
            port: None,
            python_path: python_path.into(),
            ssh_path: "ssh".into(),
            identity_file: None,
            password: None,
            check_host_keys: true,
            password_sent: false,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn peer_name(&self) -> String {
        match self.port {
            Some(p) => format!("ssh.{}:{p}", self.hostname),
            None => format!("ssh.{}", self.hostname),
        }
    }

    async fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.ssh_path);
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if !self.check_host_keys {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
        }
        let target = match &self.username {
            Some(u) => format!("{u}@{}", self.hostname),
            None => self.hostname.clone(),
        };
        cmd.arg(target);
        cmd.arg("--").arg(&self.python_path).arg("--stage1");

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.spawn().map_err(|e| Error::Bootstrap(format!("spawning ssh to {}: {e}", self.hostname)))
    }

    async fn scan_preamble_line(&mut self, line: &str, stdin: &mut ChildStdin) -> Result<()> {
        let lower = line.to_ascii_lowercase();
        if lower.contains("permission denied") {
            return Err(if self.password_sent {
                Error::BadPassword
            } else {
                Error::Auth(format!("ssh to {}: permission denied", self.hostname))
            });
        }
        if lower.contains("password") {
            let Some(password) = &self.password else {
                return Err(Error::Auth(format!("ssh to {} asked for a password, none configured", self.hostname)));
            };
            stdin.write_all(password.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            self.password_sent = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_name_includes_port_only_when_set() {
        let mut t = SshTransport::new("example.com", "/opt/relaymux");
        assert_eq!(t.peer_name(), "ssh.example.com");
        t.port = Some(2222);
        assert_eq!(t.peer_name(), "ssh.example.com:2222");
    }
}
