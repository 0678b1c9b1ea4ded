//! Instance readiness checks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Printed by the user-data script once first boot has finished.
pub const UP_MARKER: &str = "The system is finally up";

/// Per-attempt readiness checks; the provisioner wraps them in retry loops.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Does the host answer on SSH with a host key?
    async fn ssh_reachable(&self, fqdn: &str) -> bool;

    /// Has the boot payload logged `marker`?
    async fn boot_complete(&self, fqdn: &str, marker: &str) -> bool;
}

/// Probes with `ssh-keyscan` and `ssh`.
#[derive(Debug, Clone)]
pub struct SshProbe {
    username: String,
    connect_timeout: Duration,
}

impl SshProbe {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn succeeds(&self, mut cmd: Command, what: &str, fqdn: &str) -> Option<Vec<u8>> {
        // Leave room for the remote command after the connect timeout.
        let budget = self.connect_timeout * 4;
        cmd.kill_on_drop(true);
        match tokio::time::timeout(budget, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => Some(output.stdout),
            Ok(Ok(output)) => {
                debug!(%fqdn, check = what, code = ?output.status.code(), "not ready");
                None
            }
            Ok(Err(e)) => {
                debug!(%fqdn, check = what, error = %e, "could not run check");
                None
            }
            Err(_) => {
                debug!(%fqdn, check = what, "check timed out");
                None
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for SshProbe {
    async fn ssh_reachable(&self, fqdn: &str) -> bool {
        let mut cmd = Command::new("ssh-keyscan");
        cmd.arg("-T")
            .arg(self.connect_timeout.as_secs().max(1).to_string())
            .arg(fqdn);
        self.succeeds(cmd, "ssh-keyscan", fqdn)
            .await
            .is_some_and(|stdout| !stdout.trim_ascii().is_empty())
    }

    async fn boot_complete(&self, fqdn: &str, marker: &str) -> bool {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(format!("{}@{fqdn}", self.username))
            .arg(format!("grep -q '{marker}' /var/log/cloud-init*.log"));
        self.succeeds(cmd, "boot marker", fqdn).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_past_its_budget_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let probe = SshProbe::new("ubuntu").with_connect_timeout(Duration::from_millis(25));
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("sleep 1 && touch {}", marker.display()));

        assert!(probe.succeeds(cmd, "slow check", "host").await.is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "check outlived its budget");
    }

    #[tokio::test]
    async fn successful_check_returns_stdout() {
        let probe = SshProbe::new("ubuntu");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo host-key");

        let stdout = probe.succeeds(cmd, "echo", "host").await.unwrap();
        assert_eq!(stdout.trim_ascii(), b"host-key");
    }
}
