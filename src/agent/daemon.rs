use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::{AgentConfig, AgentContext};

/// Run the agent until interrupted.
///
/// One task owns the orchestrator and guard and handles, in arrival order:
/// monitor callbacks, JSON lines on stdin (operator and remote commands),
/// backend command polls and the housekeeping tick. The data directory stays
/// locked for as long as the agent runs.
pub async fn run_agent_daemon(config: AgentConfig) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut ctx = AgentContext::open(config, events_tx)?;

    tracing::info!("Starting agent daemon");
    tracing::info!("Data directory: {}", ctx.data_dir.display());
    tracing::info!("Device id: {}", ctx.state.device_id);

    ctx.mirror_device();

    // Windows armed by an earlier run (or the CLI) start ticking again;
    // overdue ones fire immediately
    ctx.monitor.resume();
    ctx.on_tick().await;

    let poller = ctx.command_poller();
    match &poller {
        Some((_, schedule)) => {
            tracing::info!(
                "Polling for remote commands every ~{} (next at {})",
                ctx.config
                    .remote
                    .as_ref()
                    .map(|r| format!("{}s", r.poll_interval))
                    .unwrap_or_default(),
                schedule.next_poll_time(ctx.now()).format("%H:%M:%S")
            );
        }
        None => tracing::info!("No remote backend configured; command polling disabled"),
    }

    let first_poll = poller
        .as_ref()
        .map(|(_, schedule)| schedule.next_interval())
        .unwrap_or(Duration::from_secs(365 * 24 * 3600));
    let next_poll = tokio::time::sleep(first_poll);
    tokio::pin!(next_poll);

    let mut tick = tokio::time::interval(Duration::from_secs(ctx.config.scheduler.tick_interval));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                tracing::debug!("Monitor event for {}: {:?}", event.activity_id(), event);
                if let Err(e) = ctx.orchestrator.handle_event(event).await {
                    tracing::error!("Failed to handle monitor event: {:#}", e);
                }
            }

            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => ctx.apply_line(&line).await,
                Ok(None) => {
                    tracing::debug!("stdin closed; no longer reading commands from it");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!("Failed to read command from stdin: {}", e);
                    stdin_open = false;
                }
            },

            _ = &mut next_poll, if poller.is_some() => {
                if let Some((commands, schedule)) = &poller {
                    if let Err(e) = ctx.poll_commands(commands).await {
                        tracing::error!("Failed to poll remote commands: {:#}", e);
                    }
                    next_poll.as_mut().reset(Instant::now() + schedule.next_interval());
                }
            }

            _ = tick.tick() => {
                ctx.on_tick().await;
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received interrupt, shutting down");
                break;
            }
        }
    }

    // Active sessions and their windows are durable; the next start resumes them
    ctx.save_state()?;
    tracing::info!("Agent stopped");
    Ok(())
}
