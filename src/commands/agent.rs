use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::agent::{self, AgentConfig, RemoteConfig, StorageConfig};
use crate::cli::AgentCommands;
use crate::unlock::HttpBackend;

use super::utils::{config_path, load_config};

pub fn run_agent_command(command: AgentCommands, config: Option<PathBuf>) -> Result<()> {
    match command {
        AgentCommands::Setup {
            data_dir,
            backend_url,
            api_key,
            parent,
            poll_interval,
            force,
        } => setup(config, data_dir, backend_url, api_key, parent, poll_interval, force),
        AgentCommands::Start => start(config),
        AgentCommands::ShowConfig => show_config(config),
    }
}

/// Write agent configuration
fn setup(
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    backend_url: Option<String>,
    api_key: Option<String>,
    is_parent: bool,
    poll_interval: u64,
    force: bool,
) -> Result<()> {
    println!("App Unlock Agent - Setup");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let path = config_path(config)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            path.display()
        );
    }

    let remote = backend_url.map(|base_url| RemoteConfig {
        base_url,
        api_key,
        is_parent,
        poll_interval,
        poll_jitter: 10,
    });

    let config = AgentConfig {
        storage: StorageConfig { data_dir },
        remote,
        ..Default::default()
    };
    config.validate().context("Invalid configuration")?;

    if let Some(remote) = &config.remote {
        // Catch a bad URL before the daemon ever starts
        HttpBackend::new(&remote.base_url, remote.api_key.clone())
            .context("Failed to configure remote backend")?;
        println!("✓ Remote backend: {}", remote.base_url);
    }

    config.save(&path)?;
    println!("✓ Configuration saved to: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set a passcode:       app-unlock passcode set 1234");
    println!("  2. Register an app:      app-unlock profile add <handle> --name <name>");
    println!("  3. Start the agent:      app-unlock agent start");

    Ok(())
}

/// Run the agent daemon in the foreground
fn start(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;

    println!("Starting agent in foreground mode...");
    println!("Press Ctrl+C to stop");
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async { agent::run_agent_daemon(config).await })
}

/// Show the effective configuration
fn show_config(config: Option<PathBuf>) -> Result<()> {
    let path = config_path(config.clone())?;
    let config = load_config(config)?;

    println!("Agent Configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if path.exists() {
        println!("# {}", path.display());
    } else {
        println!("# {} (not found, showing defaults)", path.display());
    }
    println!();

    let mut shown = config.clone();
    if let Some(remote) = shown.remote.as_mut() {
        if remote.api_key.is_some() {
            remote.api_key = Some("********".to_string());
        }
    }

    print!("{}", toml::to_string_pretty(&shown).context("Failed to serialize config")?);
    println!();
    println!("Data directory: {}", config.data_dir()?.display());

    Ok(())
}
