use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use super::config::AgentConfig;
use super::control::{AgentInput, ControlCommand};
use super::poller::CommandPoller;
use super::scheduler::PollingScheduler;
use super::state::{AgentState, get_agent_state_path};
use crate::platform::common::{FileLock, ensure_directory_exists};
use crate::unlock::{
    AppHandle, Clock, CommandOutcome, CommandShield, HttpBackend, MonitorEvent, PasscodeGuard,
    ProfileStore, RemoteBackend, RemoteCommand, RemoteMirror, SessionError, SessionLedger,
    SessionOrchestrator, SystemClock, TimerMonitor, Validation, WindowScheduler, commands,
};

/// Another process (normally the running agent) owns the data directory
#[derive(Debug, thiserror::Error)]
#[error(
    "{} is held by another app-unlock process; while the agent is running, send commands to it on stdin",
    .0.display()
)]
pub struct DataDirBusy(pub PathBuf);

pub const PROFILES_FILE: &str = "profiles.json";
pub const SESSIONS_FILE: &str = "sessions.json";
pub const PASSCODE_FILE: &str = "passcode.json";
pub const WINDOWS_FILE: &str = "windows.json";

/// Lock file guarding the data directory
pub fn get_agent_lock_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("agent.lock")
}

/// Everything the agent owns, wired from one [`AgentConfig`]
///
/// Only one context may be open per data directory at a time; it holds an
/// exclusive lock on `agent.lock` until dropped.
pub struct AgentContext {
    pub config: AgentConfig,
    pub data_dir: PathBuf,
    pub state: AgentState,
    pub orchestrator: SessionOrchestrator,
    pub guard: PasscodeGuard,
    pub monitor: Arc<TimerMonitor>,
    backend: Option<Arc<dyn RemoteBackend>>,
    mirror: RemoteMirror,
    clock: Arc<dyn Clock>,
    _lock: FileLock,
}

impl AgentContext {
    /// Open every store under the configured data directory.
    ///
    /// Monitor callbacks are delivered to `events`.
    pub fn open(config: AgentConfig, events: UnboundedSender<MonitorEvent>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::open_with_clock(config, events, clock)
    }

    pub fn open_with_clock(
        config: AgentConfig,
        events: UnboundedSender<MonitorEvent>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("Invalid agent configuration")?;

        let data_dir = config.data_dir()?;
        ensure_directory_exists(&data_dir)?;

        let lock_path = get_agent_lock_path(&data_dir);
        let lock = FileLock::try_acquire(&lock_path)?.ok_or(DataDirBusy(lock_path))?;
        tracing::debug!("Holding {}", lock.path().display());

        let state = AgentState::load_or_create(&get_agent_state_path(&data_dir))?;

        let (backend, mirror) = match &config.remote {
            Some(remote) => {
                let backend: Arc<dyn RemoteBackend> =
                    Arc::new(HttpBackend::new(&remote.base_url, remote.api_key.clone())?);
                let mirror = RemoteMirror::new(backend.clone(), state.device_id.clone(), remote.is_parent);
                (Some(backend), mirror)
            }
            None => (None, RemoteMirror::disabled()),
        };

        let monitor = Arc::new(TimerMonitor::open(
            data_dir.join(WINDOWS_FILE),
            config.scheduler.max_windows,
            clock.clone(),
            events,
        )?);

        let orchestrator = SessionOrchestrator::new(
            SessionLedger::open(data_dir.join(SESSIONS_FILE))?,
            ProfileStore::open(data_dir.join(PROFILES_FILE))?,
            WindowScheduler::new(monitor.clone(), clock.clone(), config.retry_policy()),
            Arc::new(CommandShield::new(config.shield_hooks())),
            clock.clone(),
        );

        let guard = PasscodeGuard::open(
            data_dir.join(PASSCODE_FILE),
            config.guard_policy(),
            clock.clone(),
            mirror.clone(),
        )?;

        Ok(Self {
            config,
            data_dir,
            state,
            orchestrator,
            guard,
            monitor,
            backend,
            mirror,
            clock,
            _lock: lock,
        })
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn save_state(&self) -> Result<()> {
        self.state
            .save(&get_agent_state_path(&self.data_dir))
            .context("Failed to save agent state")
    }

    /// Announce this device to the backend (best-effort)
    pub fn mirror_device(&self) {
        self.mirror.mirror_device(self.clock.now());
    }

    pub fn command_poller(&self) -> Option<(CommandPoller, PollingScheduler)> {
        let backend = self.backend.clone()?;
        let remote = self.config.remote.as_ref()?;

        Some((
            CommandPoller::new(backend, self.state.device_id.clone()),
            PollingScheduler::new(remote.poll_interval, remote.poll_jitter),
        ))
    }

    /// Apply one remote command, recording a pending navigation if it sets one
    pub async fn apply_command(&mut self, command: RemoteCommand) -> Result<CommandOutcome> {
        let now = self.clock.now();
        let unlocking = match &command {
            RemoteCommand::Unlock { bundle_identifier, .. } => Some(bundle_identifier.clone()),
            _ => None,
        };

        let outcome = commands::dispatch(&mut self.orchestrator, command, now).await?;

        match &outcome {
            CommandOutcome::NavigationPending(navigation) => {
                self.state.set_pending_navigation(navigation.clone());
                self.save_state()?;
            }
            CommandOutcome::Unlocked { .. } => self.answer_pending_navigation(unlocking.as_deref())?,
            CommandOutcome::Blocked(_) => {}
        }

        Ok(outcome)
    }

    /// Apply an operator command from the local user
    pub async fn apply_control(&mut self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::Authenticate { passcode } => match self.guard.validate_passcode(&passcode)? {
                Validation::Valid => tracing::info!("Operator authenticated"),
                Validation::Invalid { remaining } => {
                    tracing::debug!("Authentication failed, {} attempts left", remaining)
                }
                Validation::Locked { until } => tracing::warn!("Passcode entry locked until {}", until),
            },
            ControlCommand::Unlock { handle, minutes } => {
                self.guard.require_unlocked()?;
                self.guard.touch();

                let handle = AppHandle::new(handle);
                let profile = self
                    .orchestrator
                    .profiles()
                    .get(&handle)
                    .cloned()
                    .ok_or_else(|| SessionError::ProfileNotFound(handle.to_string()))?;

                let session_id = self.orchestrator.start_session(&handle, &profile.name, minutes).await?;
                tracing::info!("{} unlocked for {} minutes (session {})", profile.name, minutes, session_id);
                self.answer_pending_navigation(profile.bundle_id.as_deref())?;
            }
            ControlCommand::Lock { handle } => {
                self.guard.touch();
                let handle = AppHandle::new(handle);
                if !self.orchestrator.end_session(&handle).await? {
                    tracing::debug!("{} was not unlocked", handle);
                }
            }
            ControlCommand::LockAll => {
                self.guard.touch();
                let stopped = self.orchestrator.stop_all_sessions().await?;
                tracing::info!("Locked {} applications", stopped.len());
            }
            ControlCommand::Activity => self.guard.touch(),
            ControlCommand::Background => self.guard.enter_background(),
            ControlCommand::Foreground => {
                if self.guard.enter_foreground() {
                    tracing::info!("Passcode required after returning to the foreground");
                }
            }
        }

        Ok(())
    }

    /// Parse and apply one line of agent input; failures are logged
    pub async fn apply_line(&mut self, line: &str) {
        let input = match AgentInput::parse(line) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!("Rejected command: {:#}", e);
                return;
            }
        };

        let applied = match input {
            AgentInput::Control(command) => self.apply_control(command).await,
            AgentInput::Remote(command) => self
                .apply_command(command)
                .await
                .map(|outcome| tracing::debug!("Command applied: {:?}", outcome)),
        };

        if let Err(e) = applied {
            tracing::error!("Failed to apply command: {:#}", e);
        }
    }

    /// Clear the pending navigation once its application has been unlocked
    fn answer_pending_navigation(&mut self, bundle_identifier: Option<&str>) -> Result<()> {
        let answered = self
            .state
            .pending_navigation
            .as_ref()
            .is_some_and(|n| Some(n.bundle_identifier.as_str()) == bundle_identifier);
        if !answered {
            return Ok(());
        }

        if let Some(navigation) = self.state.take_pending_navigation() {
            tracing::info!(
                "Unlock request for {} from {} answered",
                navigation.bundle_identifier,
                navigation.child_device_id
            );
        }
        self.save_state()
    }

    /// Fetch queued commands from the backend and apply them in order
    pub async fn poll_commands(&mut self, poller: &CommandPoller) -> Result<usize> {
        let commands = poller.poll().await?;
        let count = commands.len();

        for command in commands {
            if let Err(e) = self.apply_command(command).await {
                tracing::error!("Failed to apply remote command: {:#}", e);
            }
        }

        self.state.update_polled(self.clock.now());
        self.save_state()?;
        Ok(count)
    }

    /// Periodic housekeeping: idle-lock the guard and reconcile sessions
    pub async fn on_tick(&mut self) {
        if self.guard.poll_idle() {
            tracing::info!("Passcode guard locked after inactivity");
        }

        match self.orchestrator.reconcile().await {
            Ok(report) if !report.is_empty() => {
                self.state.update_reconciled(self.clock.now());
                if let Err(e) = self.save_state() {
                    tracing::warn!("{:#}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Reconciliation failed: {:#}", e),
        }
    }
}
