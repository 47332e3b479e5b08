use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::unlock::{RemoteBackend, RemoteCommand};

/// Pulls queued commands for this device from the remote backend
pub struct CommandPoller {
    backend: Arc<dyn RemoteBackend>,
    device_id: String,
    max_retries: u32,
    retry_interval: Duration,
}

impl CommandPoller {
    pub fn new(backend: Arc<dyn RemoteBackend>, device_id: impl Into<String>) -> Self {
        Self {
            backend,
            device_id: device_id.into(),
            max_retries: 2,
            retry_interval: Duration::from_secs(2),
        }
    }

    /// Fetch and parse pending commands. Unrecognized payloads are logged and skipped.
    pub async fn poll(&self) -> Result<Vec<RemoteCommand>> {
        let payloads = self.fetch_with_retry().await?;

        let mut commands = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            match RemoteCommand::from_value(payload) {
                Ok(command) => commands.push(command),
                Err(e) => tracing::warn!("Skipping remote command: {:#}", e),
            }
        }

        if !commands.is_empty() {
            tracing::info!("Received {} remote commands", commands.len());
        }
        Ok(commands)
    }

    async fn fetch_with_retry(&self) -> Result<Vec<serde_json::Value>> {
        let mut retries = 0;

        loop {
            match self.backend.fetch_commands(&self.device_id).await {
                Ok(payloads) => return Ok(payloads),
                Err(e) if retries < self.max_retries => {
                    retries += 1;
                    let backoff = self.retry_interval * 2_u32.pow(retries - 1);

                    tracing::warn!(
                        "Failed to fetch remote commands (attempt {}/{}): {}",
                        retries,
                        self.max_retries,
                        e
                    );
                    tracing::info!("Retrying in {} seconds...", backoff.as_secs());

                    sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!("Failed to fetch remote commands after {} retries", retries);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unlock::remote::testing::RecordingBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_poll_parses_and_skips_unknown() {
        let backend = Arc::new(RecordingBackend::default());
        backend.commands.lock().unwrap().extend([
            json!({"command": "block_all_apps"}),
            json!({"command": "self_destruct"}),
            json!({"action": "unlock", "bundleIdentifier": "com.example.game", "minutes": 5}),
        ]);

        let poller = CommandPoller::new(backend.clone(), "device-1");
        let commands = poller.poll().await.unwrap();

        assert_eq!(
            commands,
            vec![
                RemoteCommand::BlockAllApps,
                RemoteCommand::Unlock {
                    bundle_identifier: "com.example.game".to_string(),
                    minutes: 5,
                },
            ]
        );
        // The queue is drained
        assert!(poller.poll().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_retries_then_fails() {
        let backend = Arc::new(RecordingBackend {
            fail: true,
            ..Default::default()
        });
        let poller = CommandPoller::new(backend, "device-1");

        let started = tokio::time::Instant::now();
        assert!(poller.poll().await.is_err());
        // 2s + 4s of backoff
        assert!(started.elapsed() >= Duration::from_secs(6));
    }
}
