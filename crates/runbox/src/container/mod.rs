//! Container runtime management module.
//!
//! Provides an async interface to manage sandbox containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.
//! Every call is a single bounded subprocess invocation; a handle whose
//! container has vanished externally reports `None` rather than an error.

mod container;
mod error;

pub use container::{ContainerConfig, ContainerState, VolumeMount};
pub use error::{ContainerError, ContainerResult};

// Re-export validation function for use in this module
use container::validate_image_name;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime.
    #[default]
    Docker,
    /// Podman runtime.
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    // Container IDs are hex, container names are alphanumeric with - and _
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Container runtime abstraction for testability.
///
/// This is the capability surface the session core consumes: provision,
/// inspect state, fetch logs, destroy. All calls are bounded-latency and
/// safe on handles whose containers no longer exist.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a detached container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Stop a running container.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// Inspect the container state. `Ok(None)` when the container no longer
    /// exists.
    async fn container_state(&self, container_id: &str) -> ContainerResult<Option<ContainerState>>;

    /// Fetch the combined stdout/stderr output of a container.
    async fn logs(&self, container_id: &str) -> ContainerResult<String>;

    /// Check if an image exists locally.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;

    /// Pull an image.
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;
}

/// Container runtime client for managing sandbox containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first, then falls back to Podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Fall back to docker, will fail at runtime
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "json"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "version".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "version".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    /// Create and start a new detached container.
    ///
    /// The configuration is validated before creating the container to prevent
    /// injection attacks and ensure all inputs are well-formed.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut owned_args: Vec<String> = Vec::new();

        owned_args.push("run".to_string());
        owned_args.push("-d".to_string());

        // Container name
        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        // Network isolation
        if config.network_disabled {
            owned_args.push("--network".to_string());
            owned_args.push("none".to_string());
        }

        // Resource limits
        if let Some(ref limit) = config.memory_limit {
            owned_args.push("--memory".to_string());
            owned_args.push(limit.clone());
        }
        if let Some(quota) = config.cpu_quota {
            owned_args.push("--cpu-quota".to_string());
            owned_args.push(quota.to_string());
        }
        if let Some(period) = config.cpu_period {
            owned_args.push("--cpu-period".to_string());
            owned_args.push(period.to_string());
        }

        // Volume mounts - handle read-only flags and SELinux labels for Podman
        for mount in &config.volumes {
            let mut opts = Vec::new();
            if mount.read_only {
                opts.push("ro");
            }
            if self.runtime_type.needs_selinux_labels() {
                opts.push("Z");
            }

            owned_args.push("-v".to_string());
            if opts.is_empty() {
                owned_args.push(format!("{}:{}", mount.host_path, mount.container_path));
            } else {
                owned_args.push(format!(
                    "{}:{}:{}",
                    mount.host_path,
                    mount.container_path,
                    opts.join(",")
                ));
            }
        }

        // Environment variables
        for (key, value) in &config.env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        // Working directory
        if let Some(ref workdir) = config.workdir {
            owned_args.push("-w".to_string());
            owned_args.push(workdir.clone());
        }

        // Image
        owned_args.push(config.image.clone());

        // Command
        for cmd in &config.command {
            owned_args.push(cmd.clone());
        }

        let output = Command::new(&self.binary)
            .args(&owned_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "run".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: stderr.to_string(),
            });
        }

        // Return container ID (trimmed)
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stop a running container.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut owned_args: Vec<String> = vec!["stop".to_string()];

        if let Some(t) = timeout {
            owned_args.push("-t".to_string());
            owned_args.push(t.to_string());
        }

        owned_args.push(container_id.to_string());

        let output = Command::new(&self.binary)
            .args(&owned_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(())
    }

    /// Remove a container.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];

        if force {
            args.push("-f");
        }

        args.push(container_id);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(())
    }

    /// Get the container state via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    async fn container_state(&self, container_id: &str) -> ContainerResult<Option<ContainerState>> {
        validate_container_id_or_name(container_id)?;

        let output = Command::new(&self.binary)
            .args([
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                container_id,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        parse_container_state(&String::from_utf8_lossy(&output.stdout))
    }

    /// Get container logs (stdout and stderr combined).
    async fn logs(&self, container_id: &str) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let output = Command::new(&self.binary)
            .args(["logs", container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: stderr.to_string(),
            });
        }

        // The logs command writes container stderr to our stderr
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(format!("{}{}", stdout, stderr))
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect` (works for both Docker and Podman) instead of
    /// `podman image exists` which is Podman-specific.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;

        Ok(output.status.success())
    }

    /// Pull an image.
    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "pull".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "pull".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(())
    }
}

/// Parse the output of `inspect --format '{{.State.Status}} {{.State.ExitCode}}'`.
///
/// "exited" and "dead" are terminal; everything else still holds a live
/// process and counts as running.
fn parse_container_state(raw: &str) -> ContainerResult<Option<ContainerState>> {
    let trimmed = raw.trim().trim_matches('"');
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut parts = trimmed.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let exit_code: i64 = parts
        .next()
        .unwrap_or("0")
        .parse()
        .map_err(|_| ContainerError::ParseError(format!("bad inspect output: '{trimmed}'")))?;

    match status {
        "exited" | "dead" => Ok(Some(ContainerState::Exited(exit_code))),
        _ => Ok(Some(ContainerState::Running)),
    }
}
