use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::platform::common::{read_json, write_json};
use crate::unlock::PendingNavigation;

const STATE_VERSION: &str = "1.0";

/// Agent bookkeeping that is not part of the unlock ledger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentState {
    /// State version
    pub version: String,

    /// Unique identifier for this device, used by the remote backend
    pub device_id: String,

    /// Last time the agent polled the backend for commands
    pub last_command_poll: Option<DateTime<Utc>>,

    /// Last time the agent ran a reconciliation sweep
    pub last_reconcile: Option<DateTime<Utc>>,

    /// Navigation requested by a child device, shown until acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_navigation: Option<PendingNavigation>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            device_id: Uuid::new_v4().to_string(),
            last_command_poll: None,
            last_reconcile: None,
            pending_navigation: None,
        }
    }

    /// Load agent state from file
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let Some(state) = read_json::<AgentState>(path)? else {
            return Ok(None);
        };

        if state.version != STATE_VERSION {
            tracing::warn!(
                "State file version mismatch (expected {}, got {}). Treating as new state.",
                STATE_VERSION,
                state.version
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Load existing state, or create and persist a fresh one so the device id is stable
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if let Some(state) = Self::load(path)? {
            return Ok(state);
        }

        let state = Self::new();
        state.save(path).context("Failed to save new agent state")?;
        tracing::info!("Registered new device id {}", state.device_id);
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn update_polled(&mut self, now: DateTime<Utc>) {
        self.last_command_poll = Some(now);
    }

    pub fn update_reconciled(&mut self, now: DateTime<Utc>) {
        self.last_reconcile = Some(now);
    }

    pub fn set_pending_navigation(&mut self, navigation: PendingNavigation) {
        self.pending_navigation = Some(navigation);
    }

    /// Acknowledge and clear the pending navigation
    pub fn take_pending_navigation(&mut self) -> Option<PendingNavigation> {
        self.pending_navigation.take()
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent state file inside the data directory
pub fn get_agent_state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agent-state.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-11-16T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_agent_state_new_creates_valid_state() {
        let state = AgentState::new();
        assert_eq!(state.version, "1.0");
        assert!(!state.device_id.is_empty());
        assert!(state.last_command_poll.is_none());
        assert!(state.pending_navigation.is_none());
    }

    #[test]
    fn test_load_or_create_keeps_device_id() {
        let dir = tempdir().unwrap();
        let path = get_agent_state_path(dir.path());

        let first = AgentState::load_or_create(&path).unwrap();
        let second = AgentState::load_or_create(&path).unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn test_version_mismatch_is_treated_as_new() {
        let dir = tempdir().unwrap();
        let path = get_agent_state_path(dir.path());

        let mut state = AgentState::new();
        state.version = "0.9".to_string();
        state.save(&path).unwrap();

        assert!(AgentState::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_pending_navigation_survives_reload_until_taken() {
        let dir = tempdir().unwrap();
        let path = get_agent_state_path(dir.path());

        let mut state = AgentState::new();
        state.update_polled(now());
        state.set_pending_navigation(PendingNavigation {
            bundle_identifier: "com.example.game".to_string(),
            child_device_id: "kid-ipad".to_string(),
            received_at: now(),
        });
        state.save(&path).unwrap();

        let mut loaded = AgentState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_command_poll, Some(now()));
        let navigation = loaded.take_pending_navigation().unwrap();
        assert_eq!(navigation.child_device_id, "kid-ipad");
        assert!(loaded.pending_navigation.is_none());
    }
}
