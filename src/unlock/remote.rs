use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

/// Row in the backend's devices table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub is_parent: bool,
    pub updated_at: DateTime<Utc>,
}

/// Passcode copy kept by the backend for cross-device recovery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PasscodeSyncRecord {
    pub device_id: String,
    pub passcode: String,
    pub updated_at: DateTime<Utc>,
}

/// Remote backend used for mirroring and command delivery.
///
/// Never authoritative: local state decides every unlock.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn upsert_device(&self, record: &DeviceRecord) -> Result<()>;

    async fn upsert_passcode(&self, record: &PasscodeSyncRecord) -> Result<()>;

    /// Pending command payloads queued for this device
    async fn fetch_commands(&self, device_id: &str) -> Result<Vec<serde_json::Value>>;
}

/// REST backend reached over HTTPS
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let mut url = Url::parse(base_url).context("Invalid backend URL")?;

        if url.scheme() != "https" {
            anyhow::bail!("Backend URL must use HTTPS for security (got: {})", url.scheme());
        }

        // Url::join drops the last segment unless the base ends with a slash
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(format!("app-unlock-agent/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .https_only(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: url,
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid backend path: {}", path))
    }

    async fn put_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.endpoint(path)?;
        tracing::debug!("PUT {}", url);

        let mut request = self
            .client
            .put(url)
            .header("Content-Type", "application/json")
            .body(serde_json::to_vec(body).context("Failed to serialize record")?);

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.context("Failed to connect to backend")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Backend rejected {} with status {}", path, status);
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
        self.put_json(&format!("devices/{}", record.device_id), record).await
    }

    async fn upsert_passcode(&self, record: &PasscodeSyncRecord) -> Result<()> {
        self.put_json(&format!("passcodes/{}", record.device_id), record).await
    }

    async fn fetch_commands(&self, device_id: &str) -> Result<Vec<serde_json::Value>> {
        let url = self.endpoint(&format!("devices/{}/commands", device_id))?;
        tracing::debug!("GET {}", url);

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.context("Failed to connect to backend")?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let body = response.text().await.context("Failed to read response body")?;
                if body.trim().is_empty() {
                    return Ok(Vec::new());
                }
                serde_json::from_str(&body).context("Backend returned malformed command list")
            }
            status => anyhow::bail!("Backend returned unexpected status: {}", status),
        }
    }
}

/// Fire-and-forget mirroring of local records to the backend.
///
/// Every push runs as an independent task; callers never wait on it and
/// failures are only logged.
#[derive(Clone)]
pub struct RemoteMirror {
    backend: Option<Arc<dyn RemoteBackend>>,
    device_id: String,
    is_parent: bool,
}

impl RemoteMirror {
    pub fn new(backend: Arc<dyn RemoteBackend>, device_id: impl Into<String>, is_parent: bool) -> Self {
        Self {
            backend: Some(backend),
            device_id: device_id.into(),
            is_parent,
        }
    }

    /// Mirror that drops every push (no backend configured)
    pub fn disabled() -> Self {
        Self {
            backend: None,
            device_id: String::new(),
            is_parent: false,
        }
    }

    pub fn mirror_device(&self, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        let backend = self.backend.clone()?;
        let record = DeviceRecord {
            device_id: self.device_id.clone(),
            is_parent: self.is_parent,
            updated_at: now,
        };

        spawn_best_effort("device", async move { backend.upsert_device(&record).await })
    }

    pub fn mirror_passcode(&self, passcode: &str, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        let backend = self.backend.clone()?;
        let record = PasscodeSyncRecord {
            device_id: self.device_id.clone(),
            passcode: passcode.to_string(),
            updated_at: now,
        };

        spawn_best_effort("passcode", async move { backend.upsert_passcode(&record).await })
    }
}

fn spawn_best_effort<F>(what: &'static str, push: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("No async runtime available; skipping remote {} sync", what);
        return None;
    };

    Some(handle.spawn(async move {
        match push.await {
            Ok(()) => tracing::debug!("Remote {} sync complete", what),
            Err(e) => tracing::warn!("Remote {} sync failed: {:#}", what, e),
        }
    }))
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Backend that records pushes and serves a canned command queue
    #[derive(Default)]
    pub struct RecordingBackend {
        pub devices: Mutex<Vec<DeviceRecord>>,
        pub passcodes: Mutex<Vec<PasscodeSyncRecord>>,
        pub commands: Mutex<Vec<serde_json::Value>>,
        pub fail: bool,
    }

    #[async_trait]
    impl RemoteBackend for RecordingBackend {
        async fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            self.devices.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn upsert_passcode(&self, record: &PasscodeSyncRecord) -> Result<()> {
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            self.passcodes.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn fetch_commands(&self, _device_id: &str) -> Result<Vec<serde_json::Value>> {
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            Ok(std::mem::take(&mut *self.commands.lock().unwrap()))
        }
    }
}
