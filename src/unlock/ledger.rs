use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::model::{AppHandle, SessionStatus, UnlockSession};
use crate::platform::common::{read_json, write_json};

const LEDGER_VERSION: &str = "1.0";

#[derive(Debug, Clone, Deserialize, Serialize)]
struct LedgerDocument {
    version: String,
    sessions: BTreeMap<String, UnlockSession>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION.to_string(),
            sessions: BTreeMap::new(),
        }
    }
}

/// Durable, append-only table of unlock sessions
///
/// Sessions are keyed by id with a secondary index by application handle.
/// The ledger does not enforce the one-active-session-per-application rule;
/// the orchestrator does that before calling [`SessionLedger::add_session`].
pub struct SessionLedger {
    path: PathBuf,
    doc: LedgerDocument,
    by_handle: HashMap<AppHandle, Vec<String>>,
}

impl SessionLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = match read_json::<LedgerDocument>(&path)? {
            Some(doc) if doc.version == LEDGER_VERSION => doc,
            Some(doc) => {
                warn!(
                    "Session ledger version mismatch (expected {}, got {}). Starting a new ledger.",
                    LEDGER_VERSION, doc.version
                );
                LedgerDocument::default()
            }
            None => LedgerDocument::default(),
        };

        let mut by_handle: HashMap<AppHandle, Vec<String>> = HashMap::new();
        for session in doc.sessions.values() {
            by_handle
                .entry(session.app_handle.clone())
                .or_default()
                .push(session.id.clone());
        }

        debug!("Loaded {} sessions from {}", doc.sessions.len(), path.display());
        Ok(Self { path, doc, by_handle })
    }

    /// Insert a session by id
    pub fn add_session(&mut self, session: UnlockSession) -> Result<()> {
        debug!("Recording session {} for {}", session.id, session.app_name);

        let mut doc = self.doc.clone();
        doc.sessions.insert(session.id.clone(), session.clone());
        self.commit(doc)?;

        let ids = self.by_handle.entry(session.app_handle).or_default();
        if !ids.contains(&session.id) {
            ids.push(session.id);
        }
        Ok(())
    }

    /// All sessions currently active, keyed by session id
    pub fn active_sessions(&self) -> BTreeMap<String, UnlockSession> {
        self.doc
            .sessions
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&UnlockSession> {
        self.doc.sessions.get(id)
    }

    /// Sessions recorded for one application, oldest first
    pub fn sessions_for(&self, handle: &AppHandle) -> Vec<&UnlockSession> {
        let mut sessions: Vec<&UnlockSession> = self
            .by_handle
            .get(handle)
            .into_iter()
            .flatten()
            .filter_map(|id| self.doc.sessions.get(id))
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn active_session_for(&self, handle: &AppHandle) -> Option<&UnlockSession> {
        self.sessions_for(handle).into_iter().rev().find(|s| s.is_active())
    }

    /// Resolve a monitoring window's activity id back to its session.
    ///
    /// Activity ids are session ids. Windows armed before a session existed
    /// were keyed by the application handle, so an unknown id falls back to
    /// the active session for that handle.
    pub fn session_by_activity_id(&self, activity_id: &str) -> Option<&UnlockSession> {
        if let Some(session) = self.doc.sessions.get(activity_id) {
            return Some(session);
        }

        self.active_session_for(&AppHandle::new(activity_id))
    }

    /// Mark a session expired. Returns false for unknown or already expired ids.
    pub fn expire_session(&mut self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut doc = self.doc.clone();
        let Some(session) = doc.sessions.get_mut(id) else {
            debug!("Expire requested for unknown session {}", id);
            return Ok(false);
        };

        if !session.is_active() {
            return Ok(false);
        }

        session.status = SessionStatus::Expired;
        session.expired_at = Some(now);
        let (session_id, app_name) = (session.id.clone(), session.app_name.clone());

        self.commit(doc)?;
        info!("Session {} for {} expired", session_id, app_name);
        Ok(true)
    }

    pub fn all(&self) -> impl Iterator<Item = &UnlockSession> {
        self.doc.sessions.values()
    }

    /// Persist `doc`, then make it the in-memory view.
    ///
    /// On a failed write the ledger keeps its previous contents.
    fn commit(&mut self, doc: LedgerDocument) -> Result<()> {
        write_json(&self.path, &doc)?;
        self.doc = doc;
        Ok(())
    }
}
