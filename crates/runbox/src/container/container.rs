//! Container types and configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// A volume mount from a host path into the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: String,
    /// Path inside the container.
    pub container_path: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl VolumeMount {
    /// Create a read-only volume mount.
    pub fn read_only(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }
}

/// Configuration for creating a new sandbox container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Disable networking entirely (`--network none`).
    pub network_disabled: bool,
    /// Memory limit (e.g. "128m").
    pub memory_limit: Option<String>,
    /// CPU quota in microseconds per period.
    pub cpu_quota: Option<i64>,
    /// CPU period in microseconds.
    pub cpu_period: Option<i64>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// This should be called before creating a container to ensure all inputs
    /// are safe and well-formed.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for mount in &self.volumes {
            validate_volume_path(&mount.host_path, "host")?;
            validate_volume_path(&mount.container_path, "container")?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(ref limit) = self.memory_limit {
            validate_memory_limit(limit)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a volume mount.
    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Disable networking inside the container.
    pub fn network_disabled(mut self, disabled: bool) -> Self {
        self.network_disabled = disabled;
        self
    }

    /// Set the memory limit (e.g. "128m").
    pub fn memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Set the CPU quota/period pair.
    pub fn cpu_limits(mut self, quota: i64, period: i64) -> Self {
        self.cpu_quota = Some(quota);
        self.cpu_period = Some(period);
        self
    }
}

/// Observed state of a container, reduced to what the execution monitor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// The container still holds a live process (running, paused, starting).
    Running,
    /// The container has terminated with the given exit code.
    Exited(i64),
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Exited(code) => write!(f, "exited({code})"),
        }
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Container names must be alphanumeric with hyphens and underscores.
/// They must start with an alphanumeric character or underscore.
fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    let first_char = name.chars().next().unwrap();
    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate an environment variable key.
///
/// Environment variable names should follow POSIX conventions:
/// alphanumeric and underscores, starting with a letter or underscore.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let first_char = key.chars().next().unwrap();
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a volume path (host or container side).
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot contain null bytes",
            side
        )));
    }

    // Check for dangerous shell metacharacters
    let dangerous_chars = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
        '\'', '\n', '\r',
    ];
    for c in dangerous_chars.iter() {
        if path.contains(*c) {
            return Err(ContainerError::InvalidInput(format!(
                "{} volume path contains dangerous character '{}'",
                side, c
            )));
        }
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container path cannot be empty".to_string(),
        ));
    }

    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }

    Ok(())
}

/// Validate a memory limit string (e.g. "128m", "1g", "512000000").
fn validate_memory_limit(limit: &str) -> ContainerResult<()> {
    if limit.is_empty() {
        return Err(ContainerError::InvalidInput(
            "memory limit cannot be empty".to_string(),
        ));
    }

    let digits = limit.trim_end_matches(['b', 'k', 'm', 'g', 'B', 'K', 'M', 'G']);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "memory limit '{}' is not a number with optional b/k/m/g suffix",
            limit
        )));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("python").is_ok());
        assert!(validate_image_name("python:3.11-slim").is_ok());
        assert!(validate_image_name("library/nginx").is_ok());
        assert!(validate_image_name("myregistry.io/myimage:v1.0").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
        assert!(validate_image_name("my-image_v1").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("image`id`").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name_valid() {
        assert!(validate_container_name("mycontainer").is_ok());
        assert!(validate_container_name("my-container").is_ok());
        assert!(validate_container_name("my_container").is_ok());
        assert!(validate_container_name("container123").is_ok());
        assert!(validate_container_name("_private").is_ok());
    }

    #[test]
    fn test_validate_container_name_invalid() {
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("contains spaces").is_err());
        assert!(validate_container_name("has;semicolon").is_err());
        assert!(validate_container_name("$(whoami)").is_err());
    }

    #[test]
    fn test_validate_env_var_key_valid() {
        assert!(validate_env_var_key("PATH").is_ok());
        assert!(validate_env_var_key("MY_VAR").is_ok());
        assert!(validate_env_var_key("_PRIVATE").is_ok());
        assert!(validate_env_var_key("VAR123").is_ok());
    }

    #[test]
    fn test_validate_env_var_key_invalid() {
        assert!(validate_env_var_key("").is_err());
        assert!(validate_env_var_key("123VAR").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
        assert!(validate_env_var_key("MY VAR").is_err());
        assert!(validate_env_var_key("$(whoami)").is_err());
    }

    #[test]
    fn test_validate_volume_path_invalid() {
        assert!(validate_volume_path("", "host").is_err());
        assert!(validate_volume_path("/path;rm -rf /", "host").is_err());
        assert!(validate_volume_path("/path$(whoami)", "host").is_err());
        assert!(validate_volume_path("/path`id`", "host").is_err());
        assert!(validate_volume_path("/path\0null", "host").is_err());
    }

    #[test]
    fn test_validate_memory_limit() {
        assert!(validate_memory_limit("128m").is_ok());
        assert!(validate_memory_limit("1g").is_ok());
        assert!(validate_memory_limit("512000000").is_ok());
        assert!(validate_memory_limit("").is_err());
        assert!(validate_memory_limit("lots").is_err());
        assert!(validate_memory_limit("128m;id").is_err());
    }

    #[test]
    fn test_container_config_validate() {
        let config = ContainerConfig::new("python:3.11-slim")
            .name("runbox-abc123")
            .env("PYTHONUNBUFFERED", "1")
            .volume(VolumeMount::read_only("/tmp/runbox/abc", "/code"))
            .workdir("/code")
            .network_disabled(true)
            .memory_limit("128m")
            .cpu_limits(50_000, 100_000);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_container_config_validate_invalid_image() {
        let config = ContainerConfig::new("invalid$(whoami)");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_container_config_validate_invalid_name() {
        let config = ContainerConfig::new("python:3.11-slim").name("invalid;name");
        assert!(config.validate().is_err());
    }
}
