use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::error::{ScheduleError, SessionError};
use super::ledger::SessionLedger;
use super::model::{AppHandle, ApplicationProfile, UnlockSession};
use super::monitor::MonitorEvent;
use super::passcode::{PasscodeGuard, Validation};
use super::profiles::ProfileStore;
use super::scheduler::WindowScheduler;
use super::shield::ShieldEnforcer;

/// Where one application sits in its unlock lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Locked,
    /// Waiting on a passcode or an approval
    Unlocking,
    Unlocked {
        session_id: String,
        expires_at: DateTime<Utc>,
    },
}

/// Result of a passcode-gated unlock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Started { session_id: String },
    Rejected(Validation),
}

/// What a reconciliation sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub expired: Vec<String>,
    pub rearmed: Vec<String>,
    pub disarmed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.rearmed.is_empty() && self.disarmed.is_empty()
    }
}

/// Ties the ledger, the window scheduler and the shield together.
///
/// Owns every mutation of session state; callers run it from a single task.
pub struct SessionOrchestrator {
    ledger: SessionLedger,
    profiles: ProfileStore,
    scheduler: WindowScheduler,
    shield: Arc<dyn ShieldEnforcer>,
    clock: Arc<dyn Clock>,
    pending: HashSet<AppHandle>,
}

impl SessionOrchestrator {
    pub fn new(
        ledger: SessionLedger,
        profiles: ProfileStore,
        scheduler: WindowScheduler,
        shield: Arc<dyn ShieldEnforcer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            profiles,
            scheduler,
            shield,
            clock,
            pending: HashSet::new(),
        }
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn register_profile(
        &mut self,
        handle: AppHandle,
        name: &str,
        bundle_id: Option<String>,
    ) -> Result<ApplicationProfile> {
        let now = self.clock.now();
        self.profiles.register(handle, name, bundle_id, now)
    }

    /// Mark an application as waiting for authentication
    pub fn request_unlock(&mut self, handle: &AppHandle) -> LockState {
        if let state @ LockState::Unlocked { .. } = self.lock_state(handle) {
            debug!("{} is already unlocked", handle);
            return state;
        }

        if self.pending.insert(handle.clone()) {
            info!("Unlock requested for {}", handle);
        }
        LockState::Unlocking
    }

    /// Drop a pending request. Returns false if none was pending.
    pub fn cancel_request(&mut self, handle: &AppHandle) -> bool {
        let removed = self.pending.remove(handle);
        if removed {
            info!("Unlock request for {} cancelled", handle);
        }
        removed
    }

    pub fn lock_state(&self, handle: &AppHandle) -> LockState {
        if let Some(session) = self.ledger.active_session_for(handle) {
            return LockState::Unlocked {
                session_id: session.id.clone(),
                expires_at: session.expires_at(),
            };
        }

        if self.pending.contains(handle) {
            LockState::Unlocking
        } else {
            LockState::Locked
        }
    }

    /// Grant `minutes` of access to an application and return the new session id.
    ///
    /// A previous active session for the same handle is replaced. If the
    /// window cannot be armed the session stays recorded as active, the
    /// shield stays up, and the scheduling error is returned; a later
    /// [`reconcile`](Self::reconcile) re-arms it.
    pub async fn start_session(&mut self, handle: &AppHandle, name: &str, minutes: u32) -> Result<String> {
        if minutes == 0 {
            return Err(SessionError::InvalidDuration.into());
        }

        let now = self.clock.now();

        if let Some(prior) = self.ledger.active_session_for(handle).map(|s| s.id.clone()) {
            info!("Replacing active session {} for {}", prior, handle);
            self.ledger.expire_session(&prior, now)?;
            self.scheduler.stop_window(&prior);
        }

        self.pending.remove(handle);

        let session = UnlockSession::new(handle.clone(), name, minutes, now);
        let session_id = session.id.clone();
        self.ledger.add_session(session)?;
        info!("Started session {} for {} ({} minutes)", session_id, name, minutes);

        match self.scheduler.start_window(&session_id, handle, minutes).await {
            Ok(armed) => {
                self.relock_evicted(&armed.evicted, &session_id).await;
            }
            Err(e) => {
                if let ScheduleError::CapacityExceeded { evicted, .. } = &e {
                    self.relock_evicted(evicted, &session_id).await;
                }
                error!("Session {} is active but unmonitored; shield stays up", session_id);
                return Err(e.into());
            }
        }

        self.shield
            .lift(handle)
            .await
            .map_err(|e| enforcement(handle, &e))?;

        Ok(session_id)
    }

    /// Validate a passcode and start a session when it is accepted
    pub async fn unlock_with_passcode(
        &mut self,
        guard: &mut PasscodeGuard,
        handle: &AppHandle,
        name: &str,
        code: &str,
        minutes: u32,
    ) -> Result<UnlockOutcome> {
        self.request_unlock(handle);

        match guard.validate_passcode(code)? {
            Validation::Valid => {
                let session_id = self.start_session(handle, name, minutes).await?;
                Ok(UnlockOutcome::Started { session_id })
            }
            rejected => {
                debug!("Unlock of {} rejected: {:?}", handle, rejected);
                Ok(UnlockOutcome::Rejected(rejected))
            }
        }
    }

    /// A monitoring window ended: expire its session and block the app again.
    ///
    /// Safe to call repeatedly for the same id; only the first call for an
    /// active session re-applies the shield.
    pub async fn on_window_expired(&mut self, activity_id: &str) -> Result<()> {
        self.scheduler.stop_window(activity_id);

        let Some(session) = self.ledger.session_by_activity_id(activity_id).cloned() else {
            warn!("{}", SessionError::SessionNotFound(activity_id.to_string()));
            return Ok(());
        };

        if !session.is_active() {
            debug!("Session {} already expired", session.id);
            return Ok(());
        }

        self.expire_and_reapply(&session).await
    }

    pub async fn handle_event(&mut self, event: MonitorEvent) -> Result<()> {
        match event {
            MonitorEvent::IntervalDidStart { activity_id } => {
                debug!("Monitoring interval started for {}", activity_id);
                Ok(())
            }
            MonitorEvent::IntervalDidEnd { activity_id } | MonitorEvent::ThresholdReached { activity_id } => {
                self.on_window_expired(&activity_id).await
            }
        }
    }

    /// Re-lock one application now. Returns false if it had no active session.
    pub async fn end_session(&mut self, handle: &AppHandle) -> Result<bool> {
        self.pending.remove(handle);

        let Some(session) = self.ledger.active_session_for(handle).cloned() else {
            debug!("No active session for {}", handle);
            return Ok(false);
        };

        self.expire_and_reapply(&session).await?;
        Ok(true)
    }

    /// Expire every active session and re-block each affected application.
    ///
    /// Every handle is attempted even if an earlier shield call fails; the
    /// first failure is returned.
    pub async fn stop_all_sessions(&mut self) -> Result<Vec<AppHandle>> {
        let now = self.clock.now();
        self.pending.clear();

        let mut handles: BTreeSet<AppHandle> = BTreeSet::new();
        for session in self.ledger.active_sessions().into_values() {
            self.ledger.expire_session(&session.id, now)?;
            handles.insert(session.app_handle);
        }

        self.scheduler.stop_all_windows();

        let mut first_error = None;
        for handle in &handles {
            if let Err(e) = self.shield.reapply(handle).await {
                error!("Failed to re-apply shield for {}: {:#}", handle, e);
                first_error.get_or_insert_with(|| enforcement(handle, &e));
            }
        }

        info!("Stopped {} unlocked applications", handles.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(handles.into_iter().collect()),
        }
    }

    /// Stop every session, then block every restricted application
    pub async fn block_all_apps(&mut self) -> Result<Vec<AppHandle>> {
        let stopped = self.stop_all_sessions().await;

        if let Err(e) = self.shield.reapply_all().await {
            error!("Failed to re-apply shield for all applications: {:#}", e);
            return Err(e.context("Failed to block all applications"));
        }

        stopped
    }

    /// Bring windows and the ledger back into agreement.
    ///
    /// Overdue sessions are expired and re-shielded, active sessions without
    /// a window are re-armed for their remaining time, and windows without
    /// an active session are disarmed.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();
        let armed: HashSet<String> = self.scheduler.armed().into_iter().collect();

        for session in self.ledger.active_sessions().into_values() {
            // An earlier step in this sweep may have expired it
            if !self.ledger.get(&session.id).is_some_and(|s| s.is_active()) {
                continue;
            }

            if now >= session.expires_at() {
                info!("Session {} for {} overran its deadline", session.id, session.app_name);
                self.scheduler.stop_window(&session.id);
                if let Err(e) = self.expire_and_reapply(&session).await {
                    warn!("{:#}", e);
                }
                report.expired.push(session.id);
                continue;
            }

            if armed.contains(&session.id) {
                continue;
            }

            let minutes = session.remaining_minutes(now);
            info!(
                "Session {} for {} has no monitoring window; re-arming for {} minutes",
                session.id, session.app_name, minutes
            );
            match self
                .scheduler
                .start_window(&session.id, &session.app_handle, minutes)
                .await
            {
                Ok(rearmed) => {
                    self.relock_evicted(&rearmed.evicted, &session.id).await;
                    if let Err(e) = self.shield.lift(&session.app_handle).await {
                        warn!("Failed to lift shield for {}: {:#}", session.app_handle, e);
                    }
                    report.rearmed.push(session.id);
                }
                Err(e) => {
                    if let ScheduleError::CapacityExceeded { evicted, .. } = &e {
                        self.relock_evicted(evicted, &session.id).await;
                    }
                    warn!("Could not re-arm session {}: {}", session.id, e);
                }
            }
        }

        for activity_id in self.scheduler.armed() {
            let live = self
                .ledger
                .session_by_activity_id(&activity_id)
                .is_some_and(|s| s.is_active());
            if !live {
                debug!("Disarming orphaned window {}", activity_id);
                self.scheduler.stop_window(&activity_id);
                report.disarmed.push(activity_id);
            }
        }

        if !report.is_empty() {
            info!(
                "Reconciled sessions: {} expired, {} re-armed, {} orphaned windows disarmed",
                report.expired.len(),
                report.rearmed.len(),
                report.disarmed.len()
            );
        }

        Ok(report)
    }

    async fn expire_and_reapply(&mut self, session: &UnlockSession) -> Result<()> {
        let now = self.clock.now();
        self.ledger.expire_session(&session.id, now)?;
        self.scheduler.stop_window(&session.id);

        self.shield
            .reapply(&session.app_handle)
            .await
            .map_err(|e| enforcement(&session.app_handle, &e))
    }

    /// Expire and re-shield sessions whose windows a capacity reset removed
    async fn relock_evicted(&mut self, evicted: &[String], keep: &str) {
        for activity_id in evicted {
            let Some(session) = self.ledger.session_by_activity_id(activity_id).cloned() else {
                continue;
            };
            if session.id == keep || !session.is_active() {
                continue;
            }

            warn!(
                "Session {} for {} lost its window to a capacity reset; re-locking",
                session.id, session.app_name
            );
            if let Err(e) = self.expire_and_reapply(&session).await {
                error!("{:#}", e);
            }
        }
    }
}

fn enforcement(handle: &AppHandle, e: &anyhow::Error) -> anyhow::Error {
    SessionError::Enforcement {
        handle: handle.clone(),
        reason: format!("{:#}", e),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unlock::clock::ManualClock;
    use crate::unlock::monitor::testing::{FakeMonitor, MonitorCall};
    use crate::unlock::monitor::{ActivityMonitor, MonitorError};
    use crate::unlock::passcode::GuardPolicy;
    use crate::unlock::remote::RemoteMirror;
    use crate::unlock::scheduler::RetryPolicy;
    use crate::unlock::shield::testing::{RecordingShield, ShieldCall};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        clock: ManualClock,
        monitor: Arc<FakeMonitor>,
        shield: Arc<RecordingShield>,
        orchestrator: SessionOrchestrator,
    }

    fn harness_with(shield: RecordingShield) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at("2025-11-16T10:00:00Z");
        let monitor = Arc::new(FakeMonitor::default());
        let shield = Arc::new(shield);

        let orchestrator = SessionOrchestrator::new(
            SessionLedger::open(dir.path().join("sessions.json")).unwrap(),
            ProfileStore::open(dir.path().join("profiles.json")).unwrap(),
            WindowScheduler::new(monitor.clone(), Arc::new(clock.clone()), RetryPolicy::default()),
            shield.clone(),
            Arc::new(clock.clone()),
        );

        Harness {
            dir,
            clock,
            monitor,
            shield,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingShield::default())
    }

    fn active_count(h: &Harness, handle: &AppHandle) -> usize {
        h.orchestrator
            .ledger()
            .sessions_for(handle)
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_arms_and_lifts() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");

        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        assert!(h.orchestrator.ledger().get(&id).unwrap().is_active());
        assert_eq!(h.monitor.window(&id).unwrap().schedule.threshold_minutes, 10);
        assert_eq!(h.shield.calls(), vec![ShieldCall::Lift(handle.clone())]);
        assert!(matches!(
            h.orchestrator.lock_state(&handle),
            LockState::Unlocked { session_id, .. } if session_id == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_minutes_rejected() {
        let mut h = harness();
        let err = h
            .orchestrator
            .start_session(&AppHandle::new("tok"), "App", 0)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::InvalidDuration));
        assert_eq!(h.monitor.arm_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_relocks_exactly_once() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        h.orchestrator.on_window_expired(&id).await.unwrap();
        h.orchestrator.on_window_expired(&id).await.unwrap();

        assert!(!h.orchestrator.ledger().get(&id).unwrap().is_active());
        assert_eq!(h.shield.reapplied(&handle), 1);
        assert!(h.monitor.window(&id).is_none());
        assert_eq!(h.orchestrator.lock_state(&handle), LockState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_activity_is_ignored() {
        let mut h = harness();
        h.orchestrator.on_window_expired("no-such-window").await.unwrap();
        assert!(h.shield.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_handle_keyed_window_resolves() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        h.orchestrator
            .handle_event(MonitorEvent::IntervalDidEnd {
                activity_id: "tok-game".to_string(),
            })
            .await
            .unwrap();

        assert!(!h.orchestrator.ledger().get(&id).unwrap().is_active());
        assert!(h.monitor.window(&id).is_none());
        assert_eq!(h.shield.reapplied(&handle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_event_expires_and_interval_start_does_not() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        h.orchestrator
            .handle_event(MonitorEvent::IntervalDidStart { activity_id: id.clone() })
            .await
            .unwrap();
        assert!(h.orchestrator.ledger().get(&id).unwrap().is_active());

        h.orchestrator
            .handle_event(MonitorEvent::ThresholdReached { activity_id: id.clone() })
            .await
            .unwrap();
        assert!(!h.orchestrator.ledger().get(&id).unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_keeps_single_active_session() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");

        let first = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();
        let second = h.orchestrator.start_session(&handle, "Game", 5).await.unwrap();

        assert!(!h.orchestrator.ledger().get(&first).unwrap().is_active());
        assert!(h.orchestrator.ledger().get(&second).unwrap().is_active());
        assert_eq!(active_count(&h, &handle), 1);
        assert_eq!(h.monitor.armed(), vec![second.clone()]);
        assert_eq!(h.monitor.window(&second).unwrap().schedule.threshold_minutes, 5);
        // Replacement does not re-block in between
        assert_eq!(h.shield.reapplied(&handle), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_session_across_sequences() {
        let mut h = harness();
        let a = AppHandle::new("tok-a");
        let b = AppHandle::new("tok-b");

        let a1 = h.orchestrator.start_session(&a, "A", 10).await.unwrap();
        h.orchestrator.start_session(&b, "B", 10).await.unwrap();
        h.orchestrator.start_session(&a, "A", 3).await.unwrap();
        h.orchestrator.on_window_expired(&a1).await.unwrap();
        let a3 = h.orchestrator.start_session(&a, "A", 7).await.unwrap();
        h.orchestrator.end_session(&b).await.unwrap();

        assert_eq!(active_count(&h, &a), 1);
        assert_eq!(active_count(&h, &b), 0);
        assert_eq!(h.monitor.armed(), vec![a3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_failure_keeps_session_active_and_shielded() {
        let mut h = harness();
        let other = AppHandle::new("tok-other");
        let handle = AppHandle::new("tok-game");
        let other_id = h.orchestrator.start_session(&other, "Other", 30).await.unwrap();

        h.monitor.fail_next(MonitorError::ExcessiveActivities);
        h.monitor.fail_next(MonitorError::ExcessiveActivities);
        let started = tokio::time::Instant::now();

        let err = h
            .orchestrator
            .start_session(&handle, "Game", 10)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ScheduleError>(),
            Some(ScheduleError::CapacityExceeded { .. })
        ));
        assert!(started.elapsed() >= std::time::Duration::from_secs(1));
        assert!(h.monitor.calls().contains(&MonitorCall::DisarmAll));

        // Intent is recorded, but the app was never unblocked
        assert_eq!(active_count(&h, &handle), 1);
        assert_eq!(h.shield.lifted(&handle), 0);

        // The evicted session lost its window, so it is re-locked
        assert!(!h.orchestrator.ledger().get(&other_id).unwrap().is_active());
        assert_eq!(h.shield.reapplied(&other), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_retry_success_relocks_evicted() {
        let mut h = harness();
        let other = AppHandle::new("tok-other");
        let handle = AppHandle::new("tok-game");
        h.orchestrator.start_session(&other, "Other", 30).await.unwrap();

        h.monitor.fail_next(MonitorError::ExcessiveActivities);
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        assert_eq!(h.monitor.armed(), vec![id]);
        assert_eq!(h.shield.lifted(&handle), 1);
        assert_eq!(h.shield.reapplied(&other), 1);
        assert_eq!(active_count(&h, &other), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_rearms_unmonitored_session() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");

        h.monitor.fail_next(MonitorError::Failed("monitor offline".to_string()));
        assert!(h.orchestrator.start_session(&handle, "Game", 10).await.is_err());
        assert_eq!(h.shield.lifted(&handle), 0);

        h.clock.advance_secs(4 * 60);
        let report = h.orchestrator.reconcile().await.unwrap();

        assert_eq!(report.rearmed.len(), 1);
        let id = &report.rearmed[0];
        assert_eq!(h.monitor.window(id).unwrap().schedule.threshold_minutes, 6);
        assert_eq!(h.shield.lifted(&handle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_expires_overdue_and_drops_orphans() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        // A window left over from a session that no longer exists
        h.orchestrator
            .scheduler
            .start_window("stale-window", &AppHandle::new("tok-gone"), 5)
            .await
            .unwrap();

        h.clock.advance_secs(11 * 60);
        let report = h.orchestrator.reconcile().await.unwrap();

        assert_eq!(report.expired, vec![id.clone()]);
        assert_eq!(report.disarmed, vec!["stale-window".to_string()]);
        assert!(h.monitor.armed().is_empty());
        assert_eq!(h.shield.reapplied(&handle), 1);

        // A second sweep has nothing to do
        assert!(h.orchestrator.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_sessions_relocks_everything() {
        let mut h = harness();
        let a = AppHandle::new("tok-a");
        let b = AppHandle::new("tok-b");
        h.orchestrator.start_session(&a, "A", 10).await.unwrap();
        h.orchestrator.start_session(&b, "B", 10).await.unwrap();
        h.orchestrator.request_unlock(&AppHandle::new("tok-c"));

        let stopped = h.orchestrator.stop_all_sessions().await.unwrap();

        assert_eq!(stopped, vec![a.clone(), b.clone()]);
        assert!(h.orchestrator.ledger().active_sessions().is_empty());
        assert!(h.monitor.armed().is_empty());
        assert_eq!(h.shield.reapplied(&a), 1);
        assert_eq!(h.shield.reapplied(&b), 1);
        assert_eq!(h.orchestrator.lock_state(&AppHandle::new("tok-c")), LockState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_all_apps_reapplies_everything() {
        let mut h = harness();
        let a = AppHandle::new("tok-a");
        h.orchestrator.start_session(&a, "A", 10).await.unwrap();

        let stopped = h.orchestrator.block_all_apps().await.unwrap();

        assert_eq!(stopped, vec![a.clone()]);
        assert_eq!(
            h.shield.calls(),
            vec![ShieldCall::Lift(a.clone()), ShieldCall::Reapply(a), ShieldCall::ReapplyAll]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shield_failure_on_expiry_is_returned() {
        let mut h = harness_with(RecordingShield::failing_reapply());
        let handle = AppHandle::new("tok-game");
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        let err = h.orchestrator.on_window_expired(&id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Enforcement { .. })
        ));
        // The ledger still moves to expired
        assert!(!h.orchestrator.ledger().get(&id).unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ledger_write_on_expiry_is_retried() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");
        let id = h.orchestrator.start_session(&handle, "Game", 10).await.unwrap();

        let blocker = h.dir.path().join("sessions.tmp");
        std::fs::create_dir(&blocker).unwrap();

        assert!(h.orchestrator.on_window_expired(&id).await.is_err());
        assert!(h.orchestrator.ledger().get(&id).unwrap().is_active());
        assert_eq!(h.shield.reapplied(&handle), 0);

        // Still failing: the retry must not treat the session as done
        assert!(h.orchestrator.on_window_expired(&id).await.is_err());
        assert_eq!(h.shield.reapplied(&handle), 0);

        std::fs::remove_dir(&blocker).unwrap();
        h.clock.advance_secs(20 * 60);
        let report = h.orchestrator.reconcile().await.unwrap();

        assert_eq!(report.expired, vec![id.clone()]);
        assert_eq!(h.shield.reapplied(&handle), 1);
        let reopened = SessionLedger::open(h.dir.path().join("sessions.json")).unwrap();
        assert!(!reopened.get(&id).unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_and_cancel() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");

        assert_eq!(h.orchestrator.lock_state(&handle), LockState::Locked);
        assert_eq!(h.orchestrator.request_unlock(&handle), LockState::Unlocking);
        assert_eq!(h.orchestrator.lock_state(&handle), LockState::Unlocking);
        assert!(h.orchestrator.cancel_request(&handle));
        assert!(!h.orchestrator.cancel_request(&handle));
        assert_eq!(h.orchestrator.lock_state(&handle), LockState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_with_passcode() {
        let mut h = harness();
        let handle = AppHandle::new("tok-game");
        let mut guard = PasscodeGuard::open(
            h.dir.path().join("passcode.json"),
            GuardPolicy::default(),
            Arc::new(h.clock.clone()),
            RemoteMirror::disabled(),
        )
        .unwrap();
        guard.set_passcode("1234").unwrap();

        let outcome = h
            .orchestrator
            .unlock_with_passcode(&mut guard, &handle, "Game", "0000", 10)
            .await
            .unwrap();
        assert_eq!(outcome, UnlockOutcome::Rejected(Validation::Invalid { remaining: 2 }));
        assert_eq!(h.orchestrator.lock_state(&handle), LockState::Unlocking);

        let outcome = h
            .orchestrator
            .unlock_with_passcode(&mut guard, &handle, "Game", "1234", 10)
            .await
            .unwrap();
        let UnlockOutcome::Started { session_id } = outcome else {
            panic!("expected a session to start");
        };
        assert!(h.monitor.window(&session_id).is_some());
        assert_eq!(guard.failed_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_profile_uses_clock() {
        let mut h = harness();
        let profile = h
            .orchestrator
            .register_profile(AppHandle::new("tok"), "Game", Some("com.example.game".to_string()))
            .unwrap();
        assert_eq!(profile.created_at, h.clock.now());
        assert!(h.orchestrator.profiles().find_by_bundle_id("com.example.game").is_some());
    }
}
