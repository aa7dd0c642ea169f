//! Session data models.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Artifact is staged, container launch is in flight.
    Pending,
    /// Container is running the script.
    Running,
    /// Script terminated normally; logs are cached.
    Completed,
    /// Script terminated abnormally; reason and logs are cached.
    Failed,
    /// Container and record have been torn down. Terminal.
    CleanedUp,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::CleanedUp => write!(f, "cleaned_up"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cleaned_up" => Ok(SessionStatus::CleanedUp),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// One tracked script execution, from provisioning to cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Unique session ID, the external handle.
    pub id: String,
    /// Backend handle: the container running this session's script.
    /// One container per session, owned exclusively.
    pub container_id: String,
    /// Host directory holding the staged artifact.
    pub artifact_dir: PathBuf,
    /// Current session status.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last time the backend state was reconciled.
    pub last_checked_at: DateTime<Utc>,
    /// Captured output, set exactly once on the first observed termination so
    /// later polls never touch a possibly-destroyed backend.
    pub cached_logs: Option<String>,
    /// Failure reason, set when the script terminated abnormally.
    pub error: Option<String>,
}

impl Session {
    /// Create a new pending session.
    pub fn new(id: String, container_id: String, artifact_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            container_id,
            artifact_dir,
            status: SessionStatus::Pending,
            created_at: now,
            last_checked_at: now,
            cached_logs: None,
            error: None,
        }
    }

    /// Check if the script has terminated and its output is cached.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Completed | SessionStatus::Failed
        )
    }

    /// Age of the session.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.created_at)
    }
}

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The script is still executing.
    StillRunning,
    /// The script terminated normally.
    Finished { logs: String },
    /// The script terminated abnormally.
    Failed { reason: String, logs: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::CleanedUp,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_is_finished() {
        let mut session = Session::new(
            "s1".to_string(),
            "c1".to_string(),
            PathBuf::from("/tmp/s1"),
        );
        assert!(!session.is_finished());

        session.status = SessionStatus::Completed;
        assert!(session.is_finished());

        session.status = SessionStatus::Failed;
        assert!(session.is_finished());
    }
}
