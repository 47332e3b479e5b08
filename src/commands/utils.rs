use anyhow::{Context, Result};
use chrono::Duration;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::agent::{self, AgentConfig, AgentContext};
use crate::unlock::MonitorEvent;

/// Initialize logging
///
/// `RUST_LOG` wins over everything; otherwise `--verbose` selects debug and
/// the configured level applies.
pub fn init_logging(verbose: bool, configured: Option<&str>) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { configured.unwrap_or("info") };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Log level from the config file, if one can be read
pub fn configured_log_level(flag: Option<PathBuf>) -> Option<String> {
    let path = config_path(flag).ok()?;
    let config = AgentConfig::load_or_default(&path).ok()?;
    Some(config.logging.level)
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d", secs / 86400)
    }
}

/// Resolve the config path from the flag or the platform default
pub fn config_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => agent::get_agent_config_path(),
    }
}

/// Load the agent config, using defaults when no file exists yet
pub fn load_config(flag: Option<PathBuf>) -> Result<AgentConfig> {
    let path = config_path(flag)?;
    AgentConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load agent configuration from {}", path.display()))
}

/// Open the agent stores for a one-shot command.
///
/// Fails while the agent is running. Monitor callbacks are dropped; windows
/// armed here are persisted and picked up by the agent on its next start.
pub fn open_context(config: AgentConfig) -> Result<AgentContext> {
    let (events, _) = mpsc::unbounded_channel::<MonitorEvent>();
    AgentContext::open(config, events)
}

/// Prompt for a passcode on stdin
pub fn prompt_passcode(prompt: &str) -> Result<String> {
    eprint!("{}: ", prompt);
    std::io::stderr().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read passcode")?;
    Ok(line.trim().to_string())
}
