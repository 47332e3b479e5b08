use anyhow::{Context, Result};
use serde::Deserialize;

use crate::unlock::RemoteCommand;

/// Operator input accepted by a running agent
///
/// These come from the local user (the agent's stdin), never from the
/// backend, and are the only way to unlock an application while the agent
/// owns the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Enter the passcode
    Authenticate { passcode: String },
    /// Unlock a registered application; the guard must be unlocked
    Unlock { handle: String, minutes: u32 },
    Lock { handle: String },
    LockAll,
    /// The operator interacted with the device
    Activity,
    Background,
    Foreground,
}

/// One line of agent input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentInput {
    Control(ControlCommand),
    Remote(RemoteCommand),
}

impl AgentInput {
    /// Lines carrying an `op` field are operator commands; anything else must
    /// be a remote command payload.
    pub fn parse(line: &str) -> Result<Self> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => return RemoteCommand::from_json(line).map(Self::Remote),
        };

        if value.get("op").is_some() {
            let command = ControlCommand::deserialize(&value)
                .with_context(|| format!("Invalid control command: {}", line.trim()))?;
            return Ok(Self::Control(command));
        }

        RemoteCommand::from_value(&value).map(Self::Remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unlock::error::CommandError;

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(
            AgentInput::parse(r#"{"op":"authenticate","passcode":"1234"}"#).unwrap(),
            AgentInput::Control(ControlCommand::Authenticate {
                passcode: "1234".to_string()
            })
        );
        assert_eq!(
            AgentInput::parse(r#"{"op":"unlock","handle":"tok-game","minutes":15}"#).unwrap(),
            AgentInput::Control(ControlCommand::Unlock {
                handle: "tok-game".to_string(),
                minutes: 15,
            })
        );
        assert_eq!(
            AgentInput::parse(r#"{"op":"lock_all"}"#).unwrap(),
            AgentInput::Control(ControlCommand::LockAll)
        );
        assert_eq!(
            AgentInput::parse(r#"{"op":"background"}"#).unwrap(),
            AgentInput::Control(ControlCommand::Background)
        );
    }

    #[test]
    fn test_parse_remote_payloads() {
        assert_eq!(
            AgentInput::parse(r#"{"command":"block_all_apps"}"#).unwrap(),
            AgentInput::Remote(RemoteCommand::BlockAllApps)
        );
    }

    #[test]
    fn test_parse_rejects_unknown_input() {
        assert!(AgentInput::parse(r#"{"op":"reboot"}"#).is_err());
        assert!(AgentInput::parse(r#"{"op":"unlock","handle":"tok"}"#).is_err());

        let err = AgentInput::parse("not json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CommandError>(),
            Some(CommandError::Unrecognized(_))
        ));
    }
}
