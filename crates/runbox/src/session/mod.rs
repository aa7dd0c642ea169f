//! Session lifecycle core: registry, provisioning, monitoring, cleanup.

mod error;
mod models;
mod registry;
mod service;

pub use error::{SessionError, SessionResult};
pub use models::{PollOutcome, Session, SessionStatus};
pub use registry::SessionRegistry;
pub use service::{SessionService, SessionServiceConfig};
