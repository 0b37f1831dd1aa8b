//! Sudo transport (spec §4.6, §6 `sudo { username, sudo_path, password }`).

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use super::Transport;
use crate::error::{Error, Result};

/// Spawns `sudo -u USER -H --` and drives its password prompt.
#[derive(Debug, Clone)]
pub struct SudoTransport {
    /// Account to become.
    pub username: String,
    /// Path to the peer binary.
    pub python_path: std::path::PathBuf,
    /// Path to the `sudo` binary.
    pub sudo_path: std::path::PathBuf,
    /// Password to answer the prompt with, if any.
    pub password: Option<String>,
    /// Substring identifying sudo's password prompt (spec §4.6: "a
    /// configurable password prompt").
    pub password_prompt: String,
    password_sent: bool,
}

impl SudoTransport {
    /// A sudo transport using the conventional `"password"` prompt
    /// substring.
    #[must_use]
    pub fn new(username: impl Into<String>, python_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            username: username.into(),
            python_path: python_path.into(),
            sudo_path: "sudo".into(),
            password: None,
            password_prompt: "password".into(),
            password_sent: false,
        }
    }
}

#[async_trait]
impl Transport for SudoTransport {
    fn peer_name(&self) -> String {
        format!("sudo.{}", self.username)
    }

    async fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.sudo_path);
        cmd.arg("-u").arg(&self.username).arg("-H").arg("--").arg(&self.python_path).arg("--stage1");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.spawn().map_err(|e| Error::Bootstrap(format!("spawning sudo -u {}: {e}", self.username)))
    }

    async fn scan_preamble_line(&mut self, line: &str, stdin: &mut ChildStdin) -> Result<()> {
        let lower = line.to_ascii_lowercase();
        if lower.contains("incorrect password") {
            return Err(if self.password_sent {
                Error::BadPassword
            } else {
                Error::Auth(format!("sudo -u {}: incorrect password", self.username))
            });
        }
        if lower.contains("not in sudoers") {
            return Err(Error::Auth(format!("{} is not in sudoers", self.username)));
        }
        if lower.contains(&self.password_prompt.to_ascii_lowercase()) {
            let Some(password) = &self.password else {
                return Err(Error::Auth(format!("sudo -u {} asked for a password, none configured", self.username)));
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
    fn peer_name_includes_username() {
        let t = SudoTransport::new("root", "/opt/relaymux");
        assert_eq!(t.peer_name(), "sudo.root");
    }
}
