use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::agent::{
    AgentState, PASSCODE_FILE, PROFILES_FILE, SESSIONS_FILE, WINDOWS_FILE, get_agent_lock_path,
    get_agent_state_path,
};
use crate::cli::ProfileCommands;
use crate::platform::common::FileLock;
use crate::unlock::{
    ActivityMonitor, AppHandle, Clock, CommandOutcome, GuardState, MonitorEvent, PasscodeGuard,
    ProfileStore, RemoteCommand, RemoteMirror, SessionError, SessionLedger, SystemClock, TimerMonitor,
    UnlockOutcome,
};

use super::passcode::report;
use super::utils::{format_duration, load_config, open_context, prompt_passcode};

/// Register or list application profiles
pub fn run_profile_command(command: ProfileCommands, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut ctx = open_context(config)?;

        match command {
            ProfileCommands::Add { handle, name, bundle_id } => {
                let profile = ctx
                    .orchestrator
                    .register_profile(AppHandle::new(handle), &name, bundle_id)?;
                if profile.name != name {
                    println!("{} is already registered as \"{}\"", profile.handle, profile.name);
                } else {
                    println!("✓ Registered {} ({})", profile.name, profile.handle);
                }
            }
            ProfileCommands::List => {
                if ctx.orchestrator.profiles().len() == 0 {
                    println!("No applications registered");
                }
                for profile in ctx.orchestrator.profiles().all() {
                    println!(
                        "{:<24} {:<20} {}",
                        profile.handle,
                        profile.name,
                        profile.bundle_id.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Ok::<(), anyhow::Error>(())
    })
}

/// Unlock a registered application after checking the passcode
pub fn unlock(handle: String, minutes: u32, code: Option<String>, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut ctx = open_context(config)?;
        let handle = AppHandle::new(handle);

        let name = ctx
            .orchestrator
            .profiles()
            .get(&handle)
            .map(|p| p.name.clone())
            .ok_or_else(|| SessionError::ProfileNotFound(handle.to_string()))?;

        let code = match code {
            Some(code) => code,
            None => prompt_passcode("Passcode")?,
        };

        let outcome = ctx
            .orchestrator
            .unlock_with_passcode(&mut ctx.guard, &handle, &name, &code, minutes)
            .await?;

        match outcome {
            UnlockOutcome::Started { session_id } => {
                println!("✓ {} unlocked for {} minutes (session {})", name, minutes, session_id);
                println!("Start the agent so the unlock ends on time: app-unlock agent start");
            }
            UnlockOutcome::Rejected(rejected) => {
                report(rejected);
                ctx.orchestrator.cancel_request(&handle);
            }
        }

        Ok::<(), anyhow::Error>(())
    })
}

/// Re-lock one application
pub fn lock(handle: String, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut ctx = open_context(config)?;
        let handle = AppHandle::new(handle);

        if ctx.orchestrator.end_session(&handle).await? {
            println!("✓ {} locked", handle);
        } else {
            println!("{} was not unlocked", handle);
        }

        Ok::<(), anyhow::Error>(())
    })
}

/// Re-lock every unlocked application
pub fn lock_all(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut ctx = open_context(config)?;
        let stopped = ctx.orchestrator.stop_all_sessions().await?;
        println!("✓ Locked {} application{}", stopped.len(), if stopped.len() == 1 { "" } else { "s" });
        Ok::<(), anyhow::Error>(())
    })
}

/// Apply a JSON remote command locally
pub fn command(json: String, config: Option<PathBuf>) -> Result<()> {
    let command = RemoteCommand::from_json(&json).context("Invalid command")?;

    let config = load_config(config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut ctx = open_context(config)?;

        match ctx.apply_command(command).await? {
            CommandOutcome::Blocked(handles) => {
                println!("✓ All applications blocked ({} sessions ended)", handles.len());
            }
            CommandOutcome::Unlocked { session_id, app_name } => {
                println!("✓ {} unlocked (session {})", app_name, session_id);
            }
            CommandOutcome::NavigationPending(navigation) => {
                println!(
                    "✓ Unlock request for {} from {} recorded",
                    navigation.bundle_identifier, navigation.child_device_id
                );
            }
        }

        Ok::<(), anyhow::Error>(())
    })
}

/// Show passcode, session and window status.
///
/// Reads the stores without taking the data directory lock, so it also works
/// while the agent is running.
pub fn status(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let data_dir = config.data_dir()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();

    let agent_running = FileLock::try_acquire(&get_agent_lock_path(&data_dir))?.is_none();
    let state = AgentState::load(&get_agent_state_path(&data_dir))?;
    let profiles = ProfileStore::open(data_dir.join(PROFILES_FILE))?;
    let ledger = SessionLedger::open(data_dir.join(SESSIONS_FILE))?;
    let guard = PasscodeGuard::open(
        data_dir.join(PASSCODE_FILE),
        config.guard_policy(),
        clock.clone(),
        RemoteMirror::disabled(),
    )?;
    let (events, _) = mpsc::unbounded_channel::<MonitorEvent>();
    let windows = TimerMonitor::open(data_dir.join(WINDOWS_FILE), config.scheduler.max_windows, clock, events)?;

    println!("App Unlock Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if let Some(state) = &state {
        println!("Device id:   {}", state.device_id);
    }
    println!("Data dir:    {}", data_dir.display());
    println!("Agent:       {}", if agent_running { "running" } else { "not running" });

    let passcode = match guard.state() {
        GuardState::Unset => "not set".to_string(),
        GuardState::Unlocked | GuardState::Locked => match guard.lockout_until() {
            Some(until) => format!("locked out ({} left)", format_duration(until - now)),
            None if guard.failed_attempts() > 0 => {
                format!("set ({} failed attempts)", guard.failed_attempts())
            }
            None => "set".to_string(),
        },
    };
    println!("Passcode:    {}", passcode);

    println!();
    println!("Applications:");
    if profiles.len() == 0 {
        println!("  (none registered)");
    }
    for profile in profiles.all() {
        let state = match ledger.active_session_for(&profile.handle) {
            None => "locked".to_string(),
            Some(session) if session.expires_at() > now => {
                format!("unlocked ({} left)", format_duration(session.expires_at() - now))
            }
            Some(_) if agent_running => "unlocked (re-locking)".to_string(),
            Some(_) => "unlocked (overdue, start the agent)".to_string(),
        };
        println!("  {:<20} {}", profile.name, state);
    }

    let recorded = ledger.all().count();
    let active = ledger.all().filter(|s| s.is_active()).count();

    println!();
    println!("Sessions:    {} active, {} recorded", active, recorded);
    println!("Monitoring windows: {}", windows.armed().len());

    let Some(state) = state else {
        return Ok(());
    };

    if let Some(navigation) = &state.pending_navigation {
        println!();
        println!(
            "Pending request: {} from {} ({} ago)",
            navigation.bundle_identifier,
            navigation.child_device_id,
            format_duration(now - navigation.received_at)
        );
    }

    if let Some(polled) = state.last_command_poll {
        println!();
        println!(
            "Last command poll: {} ({} ago)",
            polled.format("%Y-%m-%d %H:%M:%S %Z"),
            format_duration(now - polled)
        );
    }

    Ok(())
}
