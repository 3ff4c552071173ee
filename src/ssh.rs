//! Shell access to guests through the system `ssh` client.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub key: PathBuf,
    /// Reach the guest from inside this network namespace
    #[serde(default)]
    pub netns: Option<String>,
}

impl SshConfig {
    pub fn root(host: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: "root".to_string(),
            key: key.into(),
            netns: None,
        }
    }
}

/// Result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct SshConnection {
    config: SshConfig,
}

impl SshConnection {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Full argv (program first) that runs `remote` on the guest.
    pub fn argv(&self, remote: &str) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(ns) = &self.config.netns {
            argv.extend(["ip", "netns", "exec", ns.as_str()].map(String::from));
        }
        argv.extend(
            [
                "ssh",
                "-q",
                "-o",
                "ConnectTimeout=1",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "PreferredAuthentications=publickey",
                "-i",
            ]
            .map(String::from),
        );
        argv.push(self.config.key.display().to_string());
        argv.push(format!("{}@{}", self.config.user, self.config.host));
        argv.push(remote.to_string());
        argv
    }

    pub async fn execute_command(&self, remote: &str) -> Result<CommandOutput> {
        let argv = self.argv(remote);
        debug!(target: "ssh", host = %self.config.host, cmd = remote, "running guest command");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .with_context(|| format!("running ssh to {}", self.config.host))?;
        Ok(CommandOutput {
            // Killed by a signal: report like a shell would.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Retry a trivial command until the guest answers.
    pub async fn wait_ready(&self, retries: u32, delay: Duration) -> Result<()> {
        let mut last = String::new();
        for _ in 0..retries {
            match self.execute_command("sync").await {
                Ok(out) if out.exit_code == 0 => return Ok(()),
                Ok(out) => last = out.stderr,
                Err(e) => last = e.to_string(),
            }
            tokio::time::sleep(delay).await;
        }
        bail!(
            "guest {} not reachable over ssh after {} attempts: {}",
            self.config.host,
            retries,
            last.trim()
        )
    }
}
