use super::{ControlSession, SessionState};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Thread-safe registry of the server's control sessions
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<Uuid, ControlSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Add a new session
    pub fn add(&self, session: ControlSession) {
        self.sessions.insert(session.id(), session);
    }

    pub fn get(&self, id: &Uuid) -> Option<ControlSession> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session
    pub fn remove(&self, id: &Uuid) -> Option<ControlSession> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Count registered sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// The most recently connected session that accepts new streams.
    ///
    /// A reconnecting client may briefly overlap with its previous session;
    /// the newer one wins.
    pub fn current_active(&self) -> Option<ControlSession> {
        self.sessions
            .iter()
            .filter(|entry| entry.state() == SessionState::Active)
            .max_by_key(|entry| entry.connected_at())
            .map(|entry| entry.value().clone())
    }

    /// Ask every session to drain.
    pub fn drain_all(&self) {
        for entry in self.sessions.iter() {
            entry.drain();
        }
    }

    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.close();
        }
    }

    /// Snapshot of all sessions, for waiting without holding map guards.
    pub fn sessions(&self) -> Vec<ControlSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}
