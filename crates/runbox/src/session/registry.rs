//! In-memory session registry.
//!
//! The registry is the single shared mutable structure of the core. All
//! mutation goes through its operations; each one is atomic with respect to
//! the record it touches, so a poll caching logs and a concurrent cleanup
//! deleting the record always resolve to one deterministic winner.

use chrono::Utc;
use dashmap::DashMap;

use super::models::{Session, SessionStatus};

/// Thread-safe map from session ID to session record.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session record.
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Get a snapshot of a session record.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session record, returning it if it existed.
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Update the last reconciliation timestamp.
    pub fn touch_checked(&self, id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_checked_at = Utc::now();
        }
    }

    /// Record the terminal outcome of a session, write-once.
    ///
    /// If the record still exists and no logs were cached yet, stores the
    /// status, logs and error atomically. If another poll already cached an
    /// outcome, the existing record wins untouched. Returns a snapshot of the
    /// record, or `None` when a concurrent cleanup already deleted it.
    pub fn record_outcome(
        &self,
        id: &str,
        status: SessionStatus,
        logs: String,
        error: Option<String>,
    ) -> Option<Session> {
        let mut entry = self.sessions.get_mut(id)?;
        if entry.cached_logs.is_none() {
            entry.status = status;
            entry.cached_logs = Some(logs);
            entry.error = error;
            entry.last_checked_at = Utc::now();
        }
        Some(entry.value().clone())
    }

    /// Snapshot all session records.
    pub fn list(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
