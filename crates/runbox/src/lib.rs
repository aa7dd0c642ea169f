//! Runbox - ephemeral sandboxed execution of untrusted Python scripts.
//!
//! Submitted scripts run inside throwaway containers (Docker or Podman) with
//! networking disabled and resource limits applied. Outcomes are exposed
//! through an asynchronous, poll-based API: submitting returns a session ID
//! immediately, polling reconciles the session with the live container state,
//! and cleanup (explicit or via the background reaper) reclaims everything.

pub mod api;
pub mod container;
pub mod session;

// Re-export commonly used types
pub use container::{ContainerConfig, ContainerRuntime, ContainerRuntimeApi, ContainerState};
pub use session::{PollOutcome, Session, SessionService, SessionServiceConfig, SessionStatus};
