use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{CommandError, SessionError};
use super::model::AppHandle;
use super::orchestrator::SessionOrchestrator;

/// Command delivered over the remote channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    BlockAllApps,
    Unlock {
        bundle_identifier: String,
        minutes: u32,
    },
    ChildUnlock {
        bundle_identifier: String,
        child_device_id: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Command(CommandPayload),
    Action(ActionPayload),
}

#[derive(Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum CommandPayload {
    BlockAllApps,
}

#[derive(Deserialize)]
#[serde(tag = "action")]
enum ActionPayload {
    #[serde(rename = "unlock", rename_all = "camelCase")]
    Unlock { bundle_identifier: String, minutes: u32 },

    #[serde(rename = "childUnlock", rename_all = "camelCase")]
    ChildUnlock {
        bundle_identifier: String,
        child_device_id: String,
    },
}

impl RemoteCommand {
    pub fn from_value(payload: &serde_json::Value) -> Result<Self> {
        let parsed = Payload::deserialize(payload)
            .map_err(|_| CommandError::Unrecognized(payload.to_string()))?;

        Ok(match parsed {
            Payload::Command(CommandPayload::BlockAllApps) => Self::BlockAllApps,
            Payload::Action(ActionPayload::Unlock {
                bundle_identifier,
                minutes,
            }) => Self::Unlock {
                bundle_identifier,
                minutes,
            },
            Payload::Action(ActionPayload::ChildUnlock {
                bundle_identifier,
                child_device_id,
            }) => Self::ChildUnlock {
                bundle_identifier,
                child_device_id,
            },
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|_| CommandError::Unrecognized(text.trim().to_string()))?;
        Self::from_value(&value)
    }
}

/// Navigation requested by a parent device, surfaced on next status check
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PendingNavigation {
    pub bundle_identifier: String,
    pub child_device_id: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Blocked(Vec<AppHandle>),
    Unlocked { session_id: String, app_name: String },
    NavigationPending(PendingNavigation),
}

/// Apply a remote command to the orchestrator
pub async fn dispatch(
    orchestrator: &mut SessionOrchestrator,
    command: RemoteCommand,
    now: DateTime<Utc>,
) -> Result<CommandOutcome> {
    match command {
        RemoteCommand::BlockAllApps => {
            info!("Remote command: block all applications");
            let stopped = orchestrator.block_all_apps().await?;
            Ok(CommandOutcome::Blocked(stopped))
        }
        RemoteCommand::Unlock {
            bundle_identifier,
            minutes,
        } => {
            let profile = orchestrator
                .profiles()
                .find_by_bundle_id(&bundle_identifier)
                .cloned()
                .ok_or_else(|| SessionError::ProfileNotFound(bundle_identifier.clone()))?;

            info!("Remote command: unlock {} for {} minutes", profile.name, minutes);
            let session_id = orchestrator
                .start_session(&profile.handle, &profile.name, minutes)
                .await?;

            Ok(CommandOutcome::Unlocked {
                session_id,
                app_name: profile.name,
            })
        }
        RemoteCommand::ChildUnlock {
            bundle_identifier,
            child_device_id,
        } => {
            info!(
                "Remote command: unlock request for {} from child device {}",
                bundle_identifier, child_device_id
            );
            Ok(CommandOutcome::NavigationPending(PendingNavigation {
                bundle_identifier,
                child_device_id,
                received_at: now,
            }))
        }
    }
}
