//! Typed errors for the session core.
//!
//! Abnormal script termination is deliberately *not* an error: it is reported
//! as a poll outcome. Best-effort teardown failures are logged and counted,
//! never propagated.

use thiserror::Error;

use crate::container::ContainerError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The caller supplied a bad or missing artifact.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The isolation substrate could not satisfy the request.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] ContainerError),

    /// The session is unknown or already cleaned up.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Host-side staging failed.
    #[error("io error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Attach context to an IO error.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
