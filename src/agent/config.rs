use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::platform;
use crate::unlock::{GuardPolicy, RetryPolicy, ShieldHooks};

/// Agent configuration, stored as TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub passcode: PasscodeConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Remote backend; mirroring and command polling are off without it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub shield: ShieldConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding profiles, sessions, windows and passcode state.
    /// Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PasscodeConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lockout after too many failures (seconds)
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    /// Idle time before the guard locks again (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lockout_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    30
}

impl Default for PasscodeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_secs: default_lockout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Wait after a capacity reset before retrying (milliseconds)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Device-wide ceiling on armed monitoring windows
    #[serde(default = "default_max_windows")]
    pub max_windows: usize,

    /// How often the agent checks idle-lock and reconciles sessions (seconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval: u64,
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    1
}

fn default_max_windows() -> usize {
    20
}

fn default_tick_interval() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            max_retries: default_max_retries(),
            max_windows: default_max_windows(),
            tick_interval: default_tick_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Backend base URL (must be HTTPS)
    pub base_url: String,

    /// Bearer token for the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Whether this device belongs to a parent
    #[serde(default)]
    pub is_parent: bool,

    /// Command polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Random jitter added to each poll (seconds)
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter: u64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_poll_jitter() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ShieldConfig {
    /// Command run to unblock an app; `{handle}` is substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lift_command: Option<String>,

    /// Command run to block an app again; `{handle}` is substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reapply_command: Option<String>,

    /// Command run to block every restricted app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reapply_all_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the config if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}; using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration; the file may hold an API key so it is owner-only
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        platform::common::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        platform::common::set_file_permissions(path, 0o600)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.passcode.max_attempts == 0 {
            anyhow::bail!("passcode.max_attempts must be at least 1");
        }

        if self.passcode.idle_timeout_secs == 0 {
            anyhow::bail!("passcode.idle_timeout_secs must be greater than 0");
        }

        if self.scheduler.max_windows == 0 {
            anyhow::bail!("scheduler.max_windows must be at least 1");
        }

        if self.scheduler.tick_interval == 0 {
            anyhow::bail!("scheduler.tick_interval must be greater than 0");
        }

        if let Some(remote) = &self.remote {
            let url = url::Url::parse(&remote.base_url)
                .with_context(|| format!("Invalid remote.base_url: {}", remote.base_url))?;
            if url.scheme() != "https" {
                anyhow::bail!("remote.base_url must use HTTPS (got: {})", url.scheme());
            }

            if remote.poll_interval < 10 {
                anyhow::bail!("remote.poll_interval must be at least 10 seconds");
            }
        }

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            anyhow::bail!("Unknown logging.level: {}", self.logging.level);
        }

        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => platform::default_data_dir(),
        }
    }

    pub fn guard_policy(&self) -> GuardPolicy {
        GuardPolicy {
            max_attempts: self.passcode.max_attempts,
            lockout: chrono::Duration::seconds(secs_i64(self.passcode.lockout_secs)),
            idle_timeout: chrono::Duration::seconds(secs_i64(self.passcode.idle_timeout_secs)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: std::time::Duration::from_millis(self.scheduler.backoff_ms),
            max_retries: self.scheduler.max_retries,
        }
    }

    pub fn shield_hooks(&self) -> ShieldHooks {
        ShieldHooks {
            lift: self.shield.lift_command.clone(),
            reapply: self.shield.reapply_command.clone(),
            reapply_all: self.shield.reapply_all_command.clone(),
        }
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000)
}

/// Agent config path, honoring `APP_UNLOCK_CONFIG` when set
pub fn get_agent_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("APP_UNLOCK_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    platform::default_config_path()
}
