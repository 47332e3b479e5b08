use anyhow::Result;
use clap::Parser;

mod agent;
mod cli;
mod commands;
mod platform;
mod unlock;

use cli::{Args, Commands};
use commands::utils::{configured_log_level, init_logging};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let level = configured_log_level(args.config.clone());
    init_logging(args.verbose, level.as_deref());

    let config = args.config;
    match args.command {
        Commands::Passcode { command } => commands::run_passcode_command(command, config),
        Commands::Profile { command } => commands::run_profile_command(command, config),
        Commands::Unlock { handle, minutes, code } => commands::session::unlock(handle, minutes, code, config),
        Commands::Lock { handle } => commands::session::lock(handle, config),
        Commands::LockAll => commands::session::lock_all(config),
        Commands::Status => commands::session::status(config),
        Commands::Command { json } => commands::session::command(json, config),
        Commands::Agent { command } => commands::run_agent_command(command, config),
    }
}
