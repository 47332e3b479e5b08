pub mod agent;
pub mod passcode;
pub mod session;
pub mod utils;

pub use agent::run_agent_command;
pub use passcode::run_passcode_command;
pub use session::run_profile_command;
