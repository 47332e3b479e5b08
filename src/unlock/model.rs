use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, stable token identifying a restricted application
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AppHandle(String);

impl AppHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable profile for an application selected for restriction
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApplicationProfile {
    pub handle: AppHandle,
    pub name: String,

    /// Bundle identifier used by remote unlock commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
}

/// One grant of temporary access to an application
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UnlockSession {
    pub id: String,
    pub app_handle: AppHandle,
    pub app_name: String,
    pub minutes: u32,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl UnlockSession {
    /// Create a new active session with a fresh id
    pub fn new(app_handle: AppHandle, app_name: impl Into<String>, minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app_handle,
            app_name: app_name.into(),
            minutes,
            created_at: now,
            status: SessionStatus::Active,
            expired_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// When the granted duration runs out
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(i64::from(self.minutes))
    }

    /// Whole minutes left at `now`, rounded up; zero once the deadline has passed
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> u32 {
        let remaining = self.expires_at() - now;
        if remaining <= Duration::zero() {
            return 0;
        }
        let secs = remaining.num_seconds();
        u32::try_from((secs + 59) / 60).unwrap_or(u32::MAX)
    }
}
