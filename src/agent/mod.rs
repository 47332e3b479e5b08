// Agent module: the long-running owner of unlock state
//
// The agent wires the unlock core to its collaborators (timer monitor,
// command shield, remote backend) and runs the single event loop that
// serializes every state change.

mod config;
mod context;
mod control;
mod daemon;
mod poller;
mod scheduler;
mod state;

pub use config::{AgentConfig, RemoteConfig, StorageConfig, get_agent_config_path};
pub use context::{
    AgentContext, PASSCODE_FILE, PROFILES_FILE, SESSIONS_FILE, WINDOWS_FILE, get_agent_lock_path,
};
pub use daemon::run_agent_daemon;
pub use state::{AgentState, get_agent_state_path};
