//! Session service - orchestrates the sandbox container lifecycle.
//!
//! The service owns the three operations of the core: `submit` provisions a
//! fresh sandbox for an uploaded script, `poll` reconciles registry state
//! with live backend state without ever blocking on completion, and
//! `cleanup` tears a session down idempotently. A background reaper applies
//! the same teardown to sessions that outlive the configured age.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::container::{ContainerConfig, ContainerRuntimeApi, ContainerState, VolumeMount};

use super::error::{SessionError, SessionResult};
use super::models::{PollOutcome, Session, SessionStatus};
use super::registry::SessionRegistry;

/// Prefix used for container names managed by this service.
const CONTAINER_NAME_PREFIX: &str = "runbox-";

/// Default container image.
const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Directory inside the container where the artifact is mounted.
const CODE_MOUNT_PATH: &str = "/code";

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Container image used for every sandbox.
    pub image: String,
    /// Host directory under which artifacts are staged, one subdirectory per
    /// session.
    pub work_dir: PathBuf,
    /// Maximum accepted artifact size in bytes.
    pub max_artifact_bytes: usize,
    /// Memory limit applied to each sandbox container.
    pub memory_limit: Option<String>,
    /// CPU quota in microseconds per period.
    pub cpu_quota: Option<i64>,
    /// CPU period in microseconds.
    pub cpu_period: Option<i64>,
    /// Seconds the runtime waits for a container to stop before killing it.
    pub stop_timeout_seconds: u32,
    /// Sessions older than this many seconds are reclaimed by the reaper.
    pub max_session_age_seconds: i64,
    /// Reaper sweep interval in seconds.
    pub reap_interval_seconds: u64,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            work_dir: std::env::temp_dir().join("runbox"),
            max_artifact_bytes: 1024 * 1024,
            memory_limit: Some("128m".to_string()),
            cpu_quota: Some(50_000),
            cpu_period: Some(100_000),
            stop_timeout_seconds: 5,
            max_session_age_seconds: 300,
            reap_interval_seconds: 30,
        }
    }
}

/// Service managing sandboxed script execution sessions.
pub struct SessionService {
    registry: SessionRegistry,
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: SessionServiceConfig,
    /// Best-effort teardown failures. Never surfaced to callers, but kept
    /// observable because the underlying container may have leaked.
    teardown_faults: AtomicU64,
}

impl SessionService {
    /// Create a new session service.
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: SessionServiceConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            runtime,
            config,
            teardown_faults: AtomicU64::new(0),
        }
    }

    /// Ensure the sandbox image is present locally, pulling it if missing.
    ///
    /// Called at startup so the first submission does not pay an image pull.
    pub async fn ensure_image(&self) -> SessionResult<()> {
        let exists = self
            .runtime
            .image_exists(&self.config.image)
            .await
            .map_err(SessionError::BackendUnavailable)?;

        if !exists {
            info!("Pulling sandbox image {}...", self.config.image);
            self.runtime
                .pull_image(&self.config.image)
                .await
                .map_err(SessionError::BackendUnavailable)?;
            info!("Sandbox image {} ready", self.config.image);
        } else {
            debug!("Sandbox image {} already present", self.config.image);
        }

        Ok(())
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Submit a script for execution, returning the new session ID.
    ///
    /// Stages the artifact on disk, launches a sandbox container with the
    /// staging directory mounted read-only, and registers the session only
    /// after the backend accepted the launch. The call returns as soon as the
    /// container is started; it never waits for the script to finish.
    pub async fn submit(&self, artifact: &[u8], filename: &str) -> SessionResult<String> {
        if artifact.is_empty() {
            return Err(SessionError::InvalidInput("empty artifact".to_string()));
        }
        if artifact.len() > self.config.max_artifact_bytes {
            return Err(SessionError::InvalidInput(format!(
                "artifact exceeds maximum size of {} bytes",
                self.config.max_artifact_bytes
            )));
        }
        let filename = sanitize_filename(filename).ok_or_else(|| {
            SessionError::InvalidInput(format!("invalid filename: {:?}", filename))
        })?;

        let id = Uuid::new_v4().to_string();
        let artifact_dir = self.config.work_dir.join(&id);

        fs::create_dir_all(&artifact_dir).map_err(|e| {
            SessionError::io(
                format!("creating staging directory {}", artifact_dir.display()),
                e,
            )
        })?;
        let artifact_path = artifact_dir.join(&filename);
        fs::write(&artifact_path, artifact).map_err(|e| {
            SessionError::io(format!("staging artifact {}", artifact_path.display()), e)
        })?;

        let mut container_config = ContainerConfig::new(&self.config.image)
            .name(format!("{CONTAINER_NAME_PREFIX}{id}"))
            .volume(VolumeMount::read_only(
                artifact_dir.to_string_lossy().to_string(),
                CODE_MOUNT_PATH,
            ))
            .workdir(CODE_MOUNT_PATH)
            .network_disabled(true)
            .command(vec![
                "python".to_string(),
                format!("{CODE_MOUNT_PATH}/{filename}"),
            ]);
        if let Some(ref limit) = self.config.memory_limit {
            container_config = container_config.memory_limit(limit.clone());
        }
        if let (Some(quota), Some(period)) = (self.config.cpu_quota, self.config.cpu_period) {
            container_config = container_config.cpu_limits(quota, period);
        }

        let container_id = match self.runtime.create_container(&container_config).await {
            Ok(container_id) => container_id,
            Err(e) => {
                // All-or-nothing: no registry entry, no staged files left
                // behind when the backend declines.
                if let Err(rm_err) = fs::remove_dir_all(&artifact_dir) {
                    warn!(
                        "Failed to remove staging directory {} after launch failure: {}",
                        artifact_dir.display(),
                        rm_err
                    );
                }
                return Err(SessionError::BackendUnavailable(e));
            }
        };

        let mut session = Session::new(id.clone(), container_id, artifact_dir);
        session.status = SessionStatus::Running;
        self.registry.insert(session);

        info!("Session {} started ({})", id, filename);
        Ok(id)
    }

    // ========================================================================
    // Execution Monitoring
    // ========================================================================

    /// Poll a session for its current outcome.
    ///
    /// Cheap and idempotent once the script has terminated: the first poll
    /// that observes termination fetches the logs exactly once and caches
    /// them; every later poll answers from the cache with no backend call.
    pub async fn poll(&self, session_id: &str) -> SessionResult<PollOutcome> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.cached_logs.is_some() {
            return Ok(Self::cached_outcome(&session));
        }

        let state = self
            .runtime
            .container_state(&session.container_id)
            .await
            .map_err(SessionError::BackendUnavailable)?;

        let exit_code = match state {
            Some(ContainerState::Running) => {
                self.registry.touch_checked(session_id);
                return Ok(PollOutcome::StillRunning);
            }
            Some(ContainerState::Exited(code)) => code,
            // The container vanished underneath us (cleanup raced ahead or an
            // operator removed it). The session is gone from the caller's view.
            None => {
                debug!(
                    "Container {} for session {} is gone",
                    session.container_id, session_id
                );
                return Err(SessionError::NotFound(session_id.to_string()));
            }
        };

        let logs = self
            .runtime
            .logs(&session.container_id)
            .await
            .map_err(SessionError::BackendUnavailable)?;

        let (status, error) = if exit_code == 0 {
            (SessionStatus::Completed, None)
        } else {
            (
                SessionStatus::Failed,
                Some(format!("script exited with status {exit_code}")),
            )
        };

        // Atomic against a concurrent cleanup: if the record vanished while
        // we were querying the backend, the cleanup won and we report NotFound.
        let updated = self
            .registry
            .record_outcome(session_id, status, logs, error)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        debug!("Session {} finished: {}", session_id, updated.status);
        Ok(Self::cached_outcome(&updated))
    }

    /// Build the poll outcome from a record with cached logs.
    fn cached_outcome(session: &Session) -> PollOutcome {
        let logs = session.cached_logs.clone().unwrap_or_default();
        match session.status {
            SessionStatus::Failed => PollOutcome::Failed {
                reason: session
                    .error
                    .clone()
                    .unwrap_or_else(|| "script failed".to_string()),
                logs,
            },
            _ => PollOutcome::Finished { logs },
        }
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Tear down a session: container, staged artifact, registry record.
    ///
    /// Idempotent. The record is removed first, so a concurrent poll observes
    /// NotFound rather than a half-deleted session, and a second cleanup on
    /// the same ID reports NotFound. Backend teardown errors are best-effort:
    /// logged and counted, never returned.
    pub async fn cleanup(&self, session_id: &str) -> SessionResult<()> {
        let session = self
            .registry
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        self.teardown(&session).await;
        info!("Session {} cleaned up", session_id);
        Ok(())
    }

    /// Best-effort teardown of a session's backend resources.
    async fn teardown(&self, session: &Session) {
        if let Err(e) = self
            .runtime
            .stop_container(
                &session.container_id,
                Some(self.config.stop_timeout_seconds),
            )
            .await
        {
            // Already-stopped or already-removed containers land here too.
            debug!(
                "Stop of container {} failed (may already be stopped): {}",
                session.container_id, e
            );
        }

        if let Err(e) = self
            .runtime
            .remove_container(&session.container_id, true)
            .await
        {
            self.teardown_faults.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Failed to remove container {} for session {}: {}",
                session.container_id, session.id, e
            );
        }

        if session.artifact_dir.exists()
            && let Err(e) = fs::remove_dir_all(&session.artifact_dir)
        {
            warn!(
                "Failed to remove staging directory {}: {}",
                session.artifact_dir.display(),
                e
            );
        }
    }

    /// Reclaim sessions older than the configured age.
    ///
    /// Returns the number of sessions cleaned up.
    pub async fn reap_stale(&self) -> usize {
        let max_age = chrono::Duration::seconds(self.config.max_session_age_seconds);
        let mut reaped = 0;

        for session in self.registry.list() {
            if session.age() > max_age {
                info!(
                    "Reaping session {} (age {}s)",
                    session.id,
                    session.age().num_seconds()
                );
                match self.cleanup(&session.id).await {
                    Ok(()) => reaped += 1,
                    // A client cleaned it up between the scan and here.
                    Err(SessionError::NotFound(_)) => {}
                    Err(e) => warn!("Failed to reap session {}: {}", session.id, e),
                }
            }
        }

        reaped
    }

    /// Spawn the background reaper task.
    pub fn start_reaper_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting session reaper task (check every {}s, max age {}s)",
            self.config.reap_interval_seconds, self.config.max_session_age_seconds
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                self.config.reap_interval_seconds,
            ));

            loop {
                interval.tick().await;

                let reaped = self.reap_stale().await;
                if reaped > 0 {
                    info!("Reaper cleaned up {} stale session(s)", reaped);
                }
            }
        })
    }

    /// Tear down every live session. Called on graceful shutdown.
    pub async fn shutdown_cleanup(&self) {
        let sessions = self.registry.list();
        if sessions.is_empty() {
            return;
        }

        info!("Shutting down: cleaning up {} session(s)...", sessions.len());
        for session in sessions {
            if let Err(e) = self.cleanup(&session.id).await {
                debug!("Session {} already gone during shutdown: {}", session.id, e);
            }
        }
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Number of currently tracked sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of best-effort teardown failures since startup.
    pub fn teardown_fault_count(&self) -> u64 {
        self.teardown_faults.load(Ordering::Relaxed)
    }
}

/// Sanitize an uploaded filename.
///
/// Rejects anything that could escape the staging directory or confuse the
/// container command line: path separators, parent references, control
/// characters, leading dashes.
fn sanitize_filename(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() > 255 {
        return None;
    }

    if raw == "." || raw == ".." {
        return None;
    }

    if raw.contains('/') || raw.contains('\\') || raw.contains('\0') {
        return None;
    }

    if raw.chars().any(|c| c.is_control()) {
        return None;
    }

    if raw.starts_with('-') {
        return None;
    }

    Some(raw.to_string())
}
