use chrono::{Duration, Local};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::error::ScheduleError;
use super::model::AppHandle;
use super::monitor::{ActivityMonitor, ArmedWindow, MonitorError, WindowSchedule};

/// What to do when the device refuses to arm another window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: std::time::Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: std::time::Duration::from_secs(1),
            max_retries: 1,
        }
    }
}

/// Result of a successful arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Armed {
    pub window: ArmedWindow,
    /// Other windows disarmed by a capacity reset along the way
    pub evicted: Vec<String>,
}

/// Keeps exactly one armed monitoring window per active unlock
pub struct WindowScheduler {
    monitor: Arc<dyn ActivityMonitor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl WindowScheduler {
    pub fn new(monitor: Arc<dyn ActivityMonitor>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { monitor, clock, retry }
    }

    /// Arm a window that ends the unlock after `minutes` of use.
    ///
    /// Hitting the device ceiling resets every window, waits the policy's
    /// backoff and retries; windows removed by the reset are reported in
    /// [`Armed::evicted`] or [`ScheduleError::CapacityExceeded`].
    pub async fn start_window(
        &self,
        activity_id: &str,
        app_handle: &AppHandle,
        minutes: u32,
    ) -> Result<Armed, ScheduleError> {
        self.monitor.disarm(activity_id);

        let now = self.clock.now();
        let window = ArmedWindow {
            activity_id: activity_id.to_string(),
            app_handle: app_handle.clone(),
            schedule: WindowSchedule::for_unlock(&now.with_timezone(&Local), minutes),
            armed_at: now,
            deadline: now + Duration::minutes(i64::from(minutes)),
        };

        let mut evicted: Vec<String> = Vec::new();
        let mut retries = 0;

        loop {
            match self.monitor.arm(window.clone()) {
                Ok(()) => {
                    info!(
                        "Monitoring {} for {} minutes (window {})",
                        app_handle, minutes, activity_id
                    );
                    return Ok(Armed { window, evicted });
                }
                Err(MonitorError::ExcessiveActivities) if retries < self.retry.max_retries => {
                    retries += 1;
                    warn!(
                        "Monitoring window limit reached while arming {} (attempt {}/{}); resetting all windows",
                        activity_id,
                        retries,
                        self.retry.max_retries
                    );

                    for id in self.stop_all_windows() {
                        if id != activity_id && !evicted.contains(&id) {
                            evicted.push(id);
                        }
                    }

                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(MonitorError::ExcessiveActivities) => {
                    error!(
                        "Could not arm window {} after {} retries: monitoring window limit reached",
                        activity_id, retries
                    );
                    return Err(ScheduleError::CapacityExceeded {
                        activity_id: activity_id.to_string(),
                        evicted,
                    });
                }
                Err(MonitorError::Failed(reason)) => {
                    error!("Failed to arm window {}: {}", activity_id, reason);
                    return Err(ScheduleError::Other {
                        activity_id: activity_id.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    /// Disarm one window; no-op when nothing is armed for the id
    pub fn stop_window(&self, activity_id: &str) {
        self.monitor.disarm(activity_id);
    }

    /// Disarm every window on the device, returning the ids that were armed
    pub fn stop_all_windows(&self) -> Vec<String> {
        let armed = self.monitor.armed();
        self.monitor.disarm_all();
        if !armed.is_empty() {
            info!("Disarmed {} monitoring windows", armed.len());
        }
        armed
    }

    pub fn armed(&self) -> Vec<String> {
        self.monitor.armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unlock::clock::ManualClock;
    use crate::unlock::monitor::testing::{FakeMonitor, MonitorCall};

    fn scheduler(monitor: Arc<FakeMonitor>) -> WindowScheduler {
        WindowScheduler::new(
            monitor,
            Arc::new(ManualClock::at("2025-11-16T10:00:00Z")),
            RetryPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_window_arms_once() {
        let monitor = Arc::new(FakeMonitor::default());
        let scheduler = scheduler(monitor.clone());

        let armed = scheduler
            .start_window("s1", &AppHandle::new("tok"), 15)
            .await
            .unwrap();

        assert!(armed.evicted.is_empty());
        assert_eq!(armed.window.schedule.threshold_minutes, 15);
        assert_eq!(
            armed.window.deadline - armed.window.armed_at,
            Duration::minutes(15)
        );
        assert_eq!(
            monitor.calls(),
            vec![MonitorCall::Disarm("s1".to_string()), MonitorCall::Arm("s1".to_string())]
        );
        assert_eq!(scheduler.armed(), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_existing_window() {
        let monitor = Arc::new(FakeMonitor::default());
        let scheduler = scheduler(monitor.clone());

        scheduler.start_window("s1", &AppHandle::new("tok"), 15).await.unwrap();
        scheduler.start_window("s1", &AppHandle::new("tok"), 5).await.unwrap();

        assert_eq!(scheduler.armed(), vec!["s1".to_string()]);
        assert_eq!(monitor.window("s1").unwrap().schedule.threshold_minutes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_exceeded_resets_and_retries_once() {
        let monitor = Arc::new(FakeMonitor::default());
        let scheduler = scheduler(monitor.clone());
        scheduler.start_window("other", &AppHandle::new("tok-other"), 30).await.unwrap();

        monitor.fail_next(MonitorError::ExcessiveActivities);
        let started = tokio::time::Instant::now();

        let armed = scheduler.start_window("s1", &AppHandle::new("tok"), 10).await.unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_secs(1));
        assert_eq!(armed.evicted, vec!["other".to_string()]);
        assert!(monitor.calls().contains(&MonitorCall::DisarmAll));
        assert_eq!(scheduler.armed(), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_exceeded_twice_is_surfaced() {
        let monitor = Arc::new(FakeMonitor::default());
        let scheduler = scheduler(monitor.clone());
        scheduler.start_window("other", &AppHandle::new("tok-other"), 30).await.unwrap();

        monitor.fail_next(MonitorError::ExcessiveActivities);
        monitor.fail_next(MonitorError::ExcessiveActivities);
        let started = tokio::time::Instant::now();

        let err = scheduler
            .start_window("s1", &AppHandle::new("tok"), 10)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ScheduleError::CapacityExceeded {
                activity_id: "s1".to_string(),
                evicted: vec!["other".to_string()],
            }
        );
        assert!(started.elapsed() >= std::time::Duration::from_secs(1));
        // Initial arm of "other" plus two attempts for "s1"
        assert_eq!(monitor.arm_count(), 3);
        let resets = monitor
            .calls()
            .iter()
            .filter(|c| **c == MonitorCall::DisarmAll)
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_are_not_retried() {
        let monitor = Arc::new(FakeMonitor::default());
        let scheduler = scheduler(monitor.clone());

        monitor.fail_next(MonitorError::Failed("entitlement missing".to_string()));
        let err = scheduler
            .start_window("s1", &AppHandle::new("tok"), 10)
            .await
            .unwrap_err();

        assert!(matches!(err, ScheduleError::Other { ref reason, .. } if reason == "entitlement missing"));
        assert_eq!(monitor.arm_count(), 1);
        assert!(!monitor.calls().contains(&MonitorCall::DisarmAll));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_windows_reports_disarmed_ids() {
        let monitor = Arc::new(FakeMonitor::default());
        let scheduler = scheduler(monitor.clone());
        scheduler.start_window("a", &AppHandle::new("tok-a"), 10).await.unwrap();
        scheduler.start_window("b", &AppHandle::new("tok-b"), 10).await.unwrap();

        assert_eq!(scheduler.stop_all_windows(), vec!["a".to_string(), "b".to_string()]);
        assert!(scheduler.armed().is_empty());

        scheduler.stop_window("a");
        assert!(scheduler.stop_all_windows().is_empty());
    }
}
