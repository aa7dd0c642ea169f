//! Application state shared across handlers.

use std::sync::Arc;

use crate::session::SessionService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session service for managing sandbox lifecycles.
    pub sessions: Arc<SessionService>,
}

impl AppState {
    /// Create new application state.
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }
}
