use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::model::AppHandle;

/// Enforcement primitive that blocks and unblocks applications
#[async_trait]
pub trait ShieldEnforcer: Send + Sync {
    /// Unblock one application
    async fn lift(&self, handle: &AppHandle) -> Result<()>;

    /// Block one application again
    async fn reapply(&self, handle: &AppHandle) -> Result<()>;

    /// Block every restricted application
    async fn reapply_all(&self) -> Result<()>;
}

/// Shell hooks run for each shield transition.
///
/// `{handle}` in a hook is replaced by the application handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShieldHooks {
    pub lift: Option<String>,
    pub reapply: Option<String>,
    pub reapply_all: Option<String>,
}

/// Shield backed by operator-configured commands
pub struct CommandShield {
    hooks: ShieldHooks,
}

impl CommandShield {
    pub fn new(hooks: ShieldHooks) -> Self {
        Self { hooks }
    }

    async fn run_hook(&self, name: &str, template: Option<&str>, handle: Option<&AppHandle>) -> Result<()> {
        let Some(template) = template else {
            debug!("No {} hook configured", name);
            return Ok(());
        };

        let command_line = expand(template, handle);
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            anyhow::bail!("The {} hook is empty", name);
        };
        let args: Vec<&str> = parts.collect();

        try_command(program, &args)
            .await
            .with_context(|| format!("Shield {} hook failed", name))
    }
}

#[async_trait]
impl ShieldEnforcer for CommandShield {
    async fn lift(&self, handle: &AppHandle) -> Result<()> {
        info!("Lifting shield for {}", handle);
        self.run_hook("lift", self.hooks.lift.as_deref(), Some(handle)).await
    }

    async fn reapply(&self, handle: &AppHandle) -> Result<()> {
        info!("Re-applying shield for {}", handle);
        self.run_hook("reapply", self.hooks.reapply.as_deref(), Some(handle)).await
    }

    async fn reapply_all(&self) -> Result<()> {
        info!("Re-applying shield for all applications");
        if self.hooks.reapply_all.is_none() && self.hooks.reapply.is_some() {
            warn!("No reapply_all hook configured; only per-application hooks will run");
        }
        self.run_hook("reapply_all", self.hooks.reapply_all.as_deref(), None).await
    }
}

fn expand(template: &str, handle: Option<&AppHandle>) -> String {
    match handle {
        Some(handle) => template.replace("{handle}", handle.as_str()),
        None => template.to_string(),
    }
}

/// Run a command, returning Ok only when it exits successfully
async fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", cmd))?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!(
            "Command failed: {} {:?} ({}): {}",
            cmd,
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}
