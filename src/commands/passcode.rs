use anyhow::Result;
use std::path::PathBuf;

use crate::cli::PasscodeCommands;
use crate::unlock::{PasscodeGuard, Validation};

use super::utils::{load_config, open_context};

pub fn run_passcode_command(command: PasscodeCommands, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut ctx = open_context(config)?;
        let guard = &mut ctx.guard;

        match command {
            PasscodeCommands::Set { code, current } => {
                if guard.is_set() {
                    let Some(current) = current else {
                        anyhow::bail!("A passcode is already set; pass --current to replace it");
                    };
                    if !authenticate(guard, &current)? {
                        return Ok(());
                    }
                }
                guard.set_passcode(&code)?;
                println!("✓ Passcode set");
            }
            PasscodeCommands::Check { code } => {
                if authenticate(guard, &code)? {
                    println!("✓ Passcode accepted");
                    guard.lock();
                }
            }
            PasscodeCommands::Change { current, new } => {
                let outcome = guard.change_passcode(&current, &new)?;
                if report(outcome) {
                    println!("✓ Passcode changed");
                }
            }
            PasscodeCommands::Clear { current } => {
                if authenticate(guard, &current)? {
                    guard.clear_passcode()?;
                    println!("✓ Passcode removed");
                }
            }
        }

        Ok::<(), anyhow::Error>(())
    })
}

fn authenticate(guard: &mut PasscodeGuard, code: &str) -> Result<bool> {
    let outcome = guard.validate_passcode(code)?;
    Ok(report(outcome))
}

/// Print a rejection; returns true when the passcode was accepted
pub(crate) fn report(outcome: Validation) -> bool {
    match outcome {
        Validation::Valid => true,
        Validation::Invalid { remaining: 0 } => {
            println!("✗ Incorrect passcode. Too many attempts; try again later.");
            false
        }
        Validation::Invalid { remaining } => {
            println!(
                "✗ Incorrect passcode ({} attempt{} remaining)",
                remaining,
                if remaining == 1 { "" } else { "s" }
            );
            false
        }
        Validation::Locked { until } => {
            println!(
                "✗ Passcode entry is locked until {}",
                until.with_timezone(&chrono::Local).format("%H:%M:%S")
            );
            false
        }
    }
}
