//! # Session Registry
//!
//! Process-wide store of live call sessions, keyed by session id. Webhooks
//! and media websockets look sessions up here; the per-leg coordinators
//! remove a session once both legs are done with it.
//!
//! ## Thread Safety:
//! A `RwLock` around the map lets many lookups run together while inserts
//! and removals are exclusive. Sessions themselves are handed out as
//! `Arc<CallSession>` so no lock is held while a call is running.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::session::{CallSession, SessionSummary};
use crate::error::SessionError;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<CallSession>>>,
    max_concurrent_sessions: usize,
}

/// Session counts for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active: usize,
    pub capacity: usize,
    pub by_state: HashMap<&'static str, usize>,
    pub sessions: Vec<SessionSummary>,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    /// Create and register a session for a call from `source_number` to
    /// `target_number`.
    ///
    /// ## Errors:
    /// `CapacityReached` when the registry already holds the maximum number
    /// of sessions.
    pub fn create(
        &self,
        source_number: &str,
        target_number: &str,
    ) -> Result<Arc<CallSession>, SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_concurrent_sessions {
            return Err(SessionError::CapacityReached(self.max_concurrent_sessions));
        }

        let session = Arc::new(CallSession::new(source_number, target_number));
        sessions.insert(session.id(), Arc::clone(&session));
        info!(
            session_id = %session.id(),
            active = sessions.len(),
            "session created"
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &Uuid) -> Option<Arc<CallSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Look a session up by the string id carried in URLs.
    pub fn find(&self, session_id: &str) -> Result<Arc<CallSession>, SessionError> {
        Uuid::parse_str(session_id)
            .ok()
            .and_then(|id| self.get(&id))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn remove(&self, session_id: &Uuid) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "session removed from registry");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent_sessions
    }

    pub fn sessions(&self) -> Vec<Arc<CallSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions: Vec<SessionSummary> = self.sessions().iter().map(|s| s.summary()).collect();
        let mut by_state = HashMap::new();
        for session in &sessions {
            *by_state.entry(session.state.as_str()).or_insert(0) += 1;
        }

        RegistrySummary {
            active: sessions.len(),
            capacity: self.max_concurrent_sessions,
            by_state,
            sessions,
        }
    }
}
