/// Platform-specific paths and filesystem helpers

pub mod common;

use anyhow::Result;
use std::path::PathBuf;

const APP_DIR: &str = "app-unlock";

/// Get the platform-specific directory holding profiles, sessions and passcode state
pub fn default_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        // Prefer the system location when the agent was installed system-wide
        let system_path = PathBuf::from("/var/lib").join(APP_DIR);
        if system_path.exists() {
            return Ok(system_path);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", APP_DIR) {
            return Ok(dirs.data_local_dir().to_path_buf());
        }

        anyhow::bail!("Could not determine data directory location");
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support").join(APP_DIR))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData")
                .unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push(APP_DIR);
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}

/// Get the platform-specific agent config file path
pub fn default_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let system_path = PathBuf::from("/etc").join(APP_DIR).join("agent.toml");
        if system_path.exists() {
            return Ok(system_path);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", APP_DIR) {
            return Ok(dirs.config_dir().join("agent.toml"));
        }

        anyhow::bail!("Could not determine config file location");
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support")
            .join(APP_DIR)
            .join("agent.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData")
                .unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push(APP_DIR);
        path.push("agent.toml");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}
