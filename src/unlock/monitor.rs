use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::model::AppHandle;
use crate::platform::common::{read_json, write_json};

const WINDOWS_VERSION: &str = "1.0";

/// Day-relative schedule handed to the OS monitor.
///
/// The interval always starts at midnight; the threshold is what actually
/// ends the unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct WindowSchedule {
    pub interval_start: NaiveTime,
    pub interval_end: NaiveTime,
    pub threshold_minutes: u32,
    pub repeats: bool,
}

impl WindowSchedule {
    /// Schedule for an unlock of `minutes` starting at `now` (in device-local time)
    pub fn for_unlock<Tz: TimeZone>(now: &DateTime<Tz>, minutes: u32) -> Self {
        let end = now.clone() + Duration::minutes(i64::from(minutes));

        // The primitive cannot express an interval that crosses midnight
        let interval_end = if end.date_naive() == now.date_naive() {
            end.time().with_nanosecond(0).unwrap_or(end.time())
        } else {
            NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
        };

        Self {
            interval_start: NaiveTime::MIN,
            interval_end,
            threshold_minutes: minutes,
            repeats: false,
        }
    }
}

/// One armed monitoring window
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArmedWindow {
    pub activity_id: String,
    pub app_handle: AppHandle,
    pub schedule: WindowSchedule,
    pub armed_at: DateTime<Utc>,
    /// When the usage threshold is reached if the app stays in use
    pub deadline: DateTime<Utc>,
}

/// Callback from the OS monitor, delivered over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    IntervalDidStart { activity_id: String },
    IntervalDidEnd { activity_id: String },
    ThresholdReached { activity_id: String },
}

impl MonitorEvent {
    pub fn activity_id(&self) -> &str {
        match self {
            Self::IntervalDidStart { activity_id }
            | Self::IntervalDidEnd { activity_id }
            | Self::ThresholdReached { activity_id } => activity_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("Too many activities are already being monitored")]
    ExcessiveActivities,

    #[error("{0}")]
    Failed(String),
}

/// OS-level usage monitoring primitive
///
/// The device enforces a ceiling on concurrently armed windows; `arm`
/// reports it synchronously as [`MonitorError::ExcessiveActivities`].
pub trait ActivityMonitor: Send + Sync {
    fn arm(&self, window: ArmedWindow) -> Result<(), MonitorError>;

    /// Disarm one window. Unknown ids are ignored.
    fn disarm(&self, activity_id: &str);

    fn disarm_all(&self);

    /// Activity ids currently armed
    fn armed(&self) -> Vec<String>;
}

#[derive(Debug, Deserialize, Serialize)]
struct WindowsDocument {
    version: String,
    windows: BTreeMap<String, ArmedWindow>,
}

struct Entry {
    window: ArmedWindow,
    timer: Option<JoinHandle<()>>,
}

/// In-process monitor backed by tokio timers.
///
/// Armed windows are persisted so a restarted agent resumes them, and a
/// window whose deadline passed while the agent was down fires as soon as
/// it is resumed. Delivery is at-least-once; consumers must be idempotent.
pub struct TimerMonitor {
    path: PathBuf,
    capacity: usize,
    clock: Arc<dyn Clock>,
    events: UnboundedSender<MonitorEvent>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TimerMonitor {
    pub fn open(
        path: impl Into<PathBuf>,
        capacity: usize,
        clock: Arc<dyn Clock>,
        events: UnboundedSender<MonitorEvent>,
    ) -> Result<Self> {
        let path = path.into();
        let windows = match read_json::<WindowsDocument>(&path)? {
            Some(doc) if doc.version == WINDOWS_VERSION => doc.windows,
            Some(doc) => {
                warn!(
                    "Window file version mismatch (expected {}, got {}). Dropping stored windows.",
                    WINDOWS_VERSION, doc.version
                );
                BTreeMap::new()
            }
            None => BTreeMap::new(),
        };

        let entries = windows
            .into_iter()
            .map(|(id, window)| (id, Entry { window, timer: None }))
            .collect();

        Ok(Self {
            path,
            capacity,
            clock,
            events,
            entries: Mutex::new(entries),
        })
    }

    /// Start timers for windows restored from disk. Returns how many were resumed.
    pub fn resume(&self) -> usize {
        let mut entries = self.lock_entries();
        let mut resumed = 0;

        for entry in entries.values_mut().filter(|e| e.timer.is_none()) {
            match self.spawn_timer(&entry.window) {
                Ok(timer) => {
                    entry.timer = Some(timer);
                    resumed += 1;
                }
                Err(e) => warn!("Could not resume window {}: {}", entry.window.activity_id, e),
            }
        }

        if resumed > 0 {
            info!("Resumed {} monitoring windows", resumed);
        }
        resumed
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_timer(&self, window: &ArmedWindow) -> Result<JoinHandle<()>, MonitorError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| MonitorError::Failed("no async runtime to schedule the window".to_string()))?;

        let delay = (window.deadline - self.clock.now()).to_std().unwrap_or_default();
        let activity_id = window.activity_id.clone();
        let events = self.events.clone();

        Ok(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Monitoring window {} reached its end", activity_id);
            if events.send(MonitorEvent::IntervalDidEnd { activity_id }).is_err() {
                debug!("Monitor event receiver closed");
            }
        }))
    }

    fn persist(&self, entries: &HashMap<String, Entry>) {
        let doc = WindowsDocument {
            version: WINDOWS_VERSION.to_string(),
            windows: entries
                .iter()
                .map(|(id, e)| (id.clone(), e.window.clone()))
                .collect(),
        };

        if let Err(e) = write_json(&self.path, &doc) {
            warn!("Failed to persist monitoring windows: {:#}", e);
        }
    }
}

impl ActivityMonitor for TimerMonitor {
    fn arm(&self, window: ArmedWindow) -> Result<(), MonitorError> {
        let mut entries = self.lock_entries();

        let replaced = entries.remove(&window.activity_id);
        if let Some(timer) = replaced.as_ref().and_then(|e| e.timer.as_ref()) {
            timer.abort();
        }

        if entries.len() >= self.capacity {
            if replaced.is_some() {
                self.persist(&entries);
            }
            return Err(MonitorError::ExcessiveActivities);
        }

        let timer = self.spawn_timer(&window)?;
        debug!(
            "Armed window {} until {}",
            window.activity_id,
            window.deadline.format("%H:%M:%S")
        );
        entries.insert(
            window.activity_id.clone(),
            Entry {
                window,
                timer: Some(timer),
            },
        );

        self.persist(&entries);
        Ok(())
    }

    fn disarm(&self, activity_id: &str) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.remove(activity_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            debug!("Disarmed window {}", activity_id);
            self.persist(&entries);
        }
    }

    fn disarm_all(&self) {
        let mut entries = self.lock_entries();
        for (_, entry) in entries.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        self.persist(&entries);
    }

    fn armed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_entries().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MonitorCall {
        Arm(String),
        Disarm(String),
        DisarmAll,
    }

    /// Scriptable monitor recording every call
    #[derive(Default)]
    pub struct FakeMonitor {
        pub calls: Mutex<Vec<MonitorCall>>,
        pub windows: Mutex<BTreeMap<String, ArmedWindow>>,
        /// Responses consumed by successive `arm` calls; empty means success
        pub script: Mutex<VecDeque<MonitorError>>,
    }

    impl FakeMonitor {
        pub fn fail_next(&self, error: MonitorError) {
            self.script.lock().unwrap().push_back(error);
        }

        pub fn calls(&self) -> Vec<MonitorCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn arm_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, MonitorCall::Arm(_)))
                .count()
        }

        pub fn window(&self, activity_id: &str) -> Option<ArmedWindow> {
            self.windows.lock().unwrap().get(activity_id).cloned()
        }
    }

    impl ActivityMonitor for FakeMonitor {
        fn arm(&self, window: ArmedWindow) -> Result<(), MonitorError> {
            self.calls
                .lock()
                .unwrap()
                .push(MonitorCall::Arm(window.activity_id.clone()));

            if let Some(error) = self.script.lock().unwrap().pop_front() {
                return Err(error);
            }

            self.windows
                .lock()
                .unwrap()
                .insert(window.activity_id.clone(), window);
            Ok(())
        }

        fn disarm(&self, activity_id: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(MonitorCall::Disarm(activity_id.to_string()));
            self.windows.lock().unwrap().remove(activity_id);
        }

        fn disarm_all(&self) {
            self.calls.lock().unwrap().push(MonitorCall::DisarmAll);
            self.windows.lock().unwrap().clear();
        }

        fn armed(&self) -> Vec<String> {
            self.windows.lock().unwrap().keys().cloned().collect()
        }
    }
}
