//! Typed failures for the unlock core.
//!
//! Operations return `anyhow::Result`; these enums are the payloads callers
//! can `downcast_ref` to when they need to branch on the failure kind.

use chrono::{DateTime, Utc};

use super::model::AppHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PasscodeError {
    #[error("Passcode must be exactly 4 digits")]
    InvalidFormat,

    #[error("No passcode has been set")]
    NotAuthenticated,

    #[error("Passcode entry is locked until {until}")]
    LockedOut { until: DateTime<Utc> },

    #[error("Passcode guard is locked; enter the passcode first")]
    GuardLocked,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Too many monitoring windows armed; could not arm {activity_id}")]
    CapacityExceeded {
        activity_id: String,
        /// Windows disarmed by the device-wide reset before the retry
        evicted: Vec<String>,
    },

    #[error("Failed to arm monitoring window {activity_id}: {reason}")]
    Other { activity_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No session found for activity {0}")]
    SessionNotFound(String),

    #[error("No profile registered for {0}")]
    ProfileNotFound(String),

    #[error("Unlock duration must be at least one minute")]
    InvalidDuration,

    #[error("Shield enforcement failed for {handle}: {reason}")]
    Enforcement { handle: AppHandle, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unrecognized remote command: {0}")]
    Unrecognized(String),
}
