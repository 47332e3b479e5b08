use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::model::{AppHandle, ApplicationProfile};
use crate::platform::common::{read_json, write_json};

const PROFILES_VERSION: &str = "1.0";

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ProfilesDocument {
    version: String,
    profiles: BTreeMap<AppHandle, ApplicationProfile>,
}

impl Default for ProfilesDocument {
    fn default() -> Self {
        Self {
            version: PROFILES_VERSION.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

/// Durable mapping from application handle to profile
pub struct ProfileStore {
    path: PathBuf,
    doc: ProfilesDocument,
}

impl ProfileStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = match read_json::<ProfilesDocument>(&path)? {
            Some(doc) if doc.version == PROFILES_VERSION => doc,
            Some(doc) => {
                warn!(
                    "Profile file version mismatch (expected {}, got {}). Starting with no profiles.",
                    PROFILES_VERSION, doc.version
                );
                ProfilesDocument::default()
            }
            None => ProfilesDocument::default(),
        };

        debug!("Loaded {} profiles from {}", doc.profiles.len(), path.display());
        Ok(Self { path, doc })
    }

    /// Register an application the first time it is selected for restriction.
    ///
    /// Profiles are immutable: registering a known handle returns the stored
    /// profile untouched.
    pub fn register(
        &mut self,
        handle: AppHandle,
        name: &str,
        bundle_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApplicationProfile> {
        if let Some(existing) = self.doc.profiles.get(&handle) {
            debug!("Profile for {} already registered", existing.name);
            return Ok(existing.clone());
        }

        let profile = ApplicationProfile {
            handle: handle.clone(),
            name: name.to_string(),
            bundle_id,
            created_at: now,
        };

        self.doc.profiles.insert(handle, profile.clone());
        self.save()?;

        info!("Registered application profile: {}", profile.name);
        Ok(profile)
    }

    pub fn get(&self, handle: &AppHandle) -> Option<&ApplicationProfile> {
        self.doc.profiles.get(handle)
    }

    pub fn find_by_bundle_id(&self, bundle_id: &str) -> Option<&ApplicationProfile> {
        self.doc
            .profiles
            .values()
            .find(|p| p.bundle_id.as_deref() == Some(bundle_id))
    }

    pub fn all(&self) -> impl Iterator<Item = &ApplicationProfile> {
        self.doc.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.doc.profiles.len()
    }

    fn save(&self) -> Result<()> {
        write_json(&self.path, &self.doc)
    }
}
