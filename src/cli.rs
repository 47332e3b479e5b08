use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// App Unlock Agent
///
/// Keeps restricted applications blocked by default and unblocks them for a
/// passcode-approved number of minutes, re-blocking them when time runs out.
#[derive(Parser, Debug)]
#[command(name = "app-unlock")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the agent configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the local passcode
    Passcode {
        #[command(subcommand)]
        command: PasscodeCommands,
    },
    /// Manage restricted application profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Unlock an application for a number of minutes (asks for the passcode)
    Unlock {
        /// Application handle
        handle: String,

        /// Minutes of access to grant
        #[arg(short, long)]
        minutes: u32,

        /// Passcode (prompted for when omitted)
        #[arg(long)]
        code: Option<String>,
    },
    /// Re-lock one application now
    Lock {
        /// Application handle
        handle: String,
    },
    /// Re-lock every unlocked application
    LockAll,
    /// Show passcode, session and window status
    Status,
    /// Apply a remote command given as JSON
    Command {
        /// e.g. '{"command":"block_all_apps"}'
        json: String,
    },
    /// Agent daemon commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum PasscodeCommands {
    /// Set the passcode (the current one is required to replace it)
    Set {
        /// New 4-digit passcode
        code: String,

        /// Current passcode, when one is already set
        #[arg(long)]
        current: Option<String>,
    },
    /// Check a passcode without unlocking anything
    Check {
        code: String,
    },
    /// Change the passcode
    Change {
        current: String,
        new: String,
    },
    /// Remove the passcode
    Clear {
        /// Current passcode
        current: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// Register an application
    Add {
        /// Application handle
        handle: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Bundle identifier used by remote unlock commands
        #[arg(long)]
        bundle_id: Option<String>,
    },
    /// List registered applications
    List,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Write an agent configuration file
    Setup {
        /// Directory for profiles, sessions and passcode state
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Remote backend base URL (HTTPS)
        #[arg(long)]
        backend_url: Option<String>,

        /// Remote backend API key
        #[arg(long)]
        api_key: Option<String>,

        /// Mark this device as a parent device
        #[arg(long)]
        parent: bool,

        /// Command polling interval in seconds
        #[arg(long, default_value = "60")]
        poll_interval: u64,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Run the agent in the foreground
    Start,
    /// Show the effective configuration
    ShowConfig,
}
