//! Supervisor boundary: reading and restarting the daemon's service unit.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

/// What the supervisor reports about the unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceState {
    /// 0 when the unit has no running main process.
    pub main_pid: u32,
    pub active_state: String,
    pub sub_state: String,
    pub restarts: u32,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        self.active_state == "active" && self.sub_state == "running"
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn state(&self) -> Result<ServiceState>;
    async fn restart(&self) -> Result<()>;

    /// Human-readable description of the restart action, for logs.
    fn restart_action(&self) -> String;
}

/// systemd via `systemctl`.
pub struct Systemd {
    unit: String,
    user: bool,
}

impl Systemd {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into(), user: false }
    }

    /// Talk to the per-user manager (`systemctl --user`).
    pub fn user(unit: impl Into<String>) -> Self {
        Self { unit: unit.into(), user: true }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("systemctl");
        if self.user {
            cmd.arg("--user");
        }
        cmd
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn state(&self) -> Result<ServiceState> {
        let output = self
            .command()
            .args(["show", &self.unit, "--property=MainPID,ActiveState,SubState,NRestarts"])
            .output()
            .await
            .context("Failed to run systemctl show")?;
        if !output.status.success() {
            bail!(
                "systemctl show {} exited with {}: {}",
                self.unit,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let state = parse_show_output(&String::from_utf8_lossy(&output.stdout));
        debug!(unit = %self.unit, ?state, "Service state");
        Ok(state)
    }

    async fn restart(&self) -> Result<()> {
        let output = self
            .command()
            .args(["restart", &self.unit])
            .output()
            .await
            .context("Failed to run systemctl restart")?;
        if !output.status.success() {
            bail!(
                "systemctl restart {} exited with {}: {}",
                self.unit,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn restart_action(&self) -> String {
        if self.user {
            format!("systemctl --user restart {}", self.unit)
        } else {
            format!("systemctl restart {}", self.unit)
        }
    }
}

/// Parse `KEY=value` lines from `systemctl show`. Unknown keys are ignored;
/// missing or unparsable numbers read as 0.
pub fn parse_show_output(raw: &str) -> ServiceState {
    let mut state = ServiceState::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "MainPID" => state.main_pid = value.parse().unwrap_or(0),
            "ActiveState" => state.active_state = value.to_string(),
            "SubState" => state.sub_state = value.to_string(),
            "NRestarts" => state.restarts = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    state
}
