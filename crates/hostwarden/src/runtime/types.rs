//! Container types and hosting configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use super::error::{RuntimeError, RuntimeResult};

/// Deserialize a field that can be either a string or an integer (Unix timestamp).
/// Converts integers to string representation.
fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrInt;

    impl<'de> Visitor<'de> for StringOrInt {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or an integer")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(StringOrInt)
}

fn default_empty_string() -> String {
    String::new()
}

/// Configuration for creating a tenant hosting container.
///
/// Maps onto `docker|podman create`: resource limits from the host
/// template, one published service port, the tenant data directory
/// bind-mounted at `/data`, restart policy `unless-stopped`.
#[derive(Debug, Clone, Default)]
pub struct HostingConfig {
    /// Managed container name (`hw-<uuid>`).
    pub name: String,
    /// OCI image to run.
    pub image: String,
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// CPU core limit.
    pub cpu_cores: u32,
    /// Storage size quota in bytes. `None` skips `--storage-opt`
    /// (the quota-unsupported retry path).
    pub storage_bytes: Option<i64>,
    /// Host port published to the container's service port.
    pub host_port: u16,
    /// Service port inside the container.
    pub service_port: u16,
    /// Host directory bind-mounted at `/data`.
    pub data_dir: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

impl HostingConfig {
    /// Validate all fields before handing them to the runtime CLI.
    pub fn validate(&self) -> RuntimeResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;
        if self.memory_bytes <= 0 {
            return Err(RuntimeError::InvalidInput(
                "memory limit must be positive".to_string(),
            ));
        }
        if self.cpu_cores == 0 {
            return Err(RuntimeError::InvalidInput(
                "cpu core limit must be positive".to_string(),
            ));
        }
        if let Some(size) = self.storage_bytes
            && size <= 0
        {
            return Err(RuntimeError::InvalidInput(
                "storage quota must be positive".to_string(),
            ));
        }
        validate_volume_path(&self.data_dir)?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        Ok(())
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Container information from docker/podman ps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container ID.
    #[serde(alias = "ID")]
    pub id: String,

    /// Container names. Docker's ps format reports a single
    /// comma-joined string; podman reports an array.
    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    /// Image used.
    #[serde(default)]
    pub image: String,

    /// Container state.
    #[serde(default)]
    pub state: ContainerState,

    /// Status string (e.g., "Up 5 minutes").
    #[serde(default)]
    pub status: String,

    /// Creation timestamp (string or Unix timestamp integer from podman).
    #[serde(
        default = "default_empty_string",
        deserialize_with = "deserialize_string_or_int"
    )]
    pub created: String,
}

impl Container {
    /// The container's primary name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }
}

fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::One(s) => s.split(',').map(|n| n.trim().to_string()).collect(),
        Names::Many(v) => v,
    })
}

/// Container resource statistics (one `stats --format json` frame).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStats {
    /// Container ID.
    #[serde(default, alias = "ContainerID", alias = "Container")]
    pub container_id: String,

    /// Container name.
    #[serde(default)]
    pub name: String,

    /// CPU percentage.
    #[serde(default, alias = "CPUPerc", alias = "CPU")]
    pub cpu_percent: String,

    /// Memory usage.
    #[serde(default, alias = "MemUsageBytes")]
    pub mem_usage: String,

    /// Memory percentage.
    #[serde(default, alias = "MemPerc", alias = "Mem")]
    pub mem_percent: String,

    /// Network I/O.
    #[serde(default, alias = "NetIO")]
    pub net_io: String,

    /// Block I/O.
    #[serde(default, alias = "BlockIO")]
    pub block_io: String,

    /// Number of PIDs.
    #[serde(default, alias = "PIDs")]
    pub pids: String,
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> RuntimeResult<()> {
    if image.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(RuntimeError::InvalidInput(
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
        return Err(RuntimeError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(RuntimeError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings; names are alphanumeric with `-` and `_`.
pub fn validate_container_id_or_name(id: &str) -> RuntimeResult<()> {
    if id.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a container name for creation.
fn validate_container_name(name: &str) -> RuntimeResult<()> {
    validate_container_id_or_name(name)?;

    let first_char = name.chars().next().ok_or_else(|| {
        RuntimeError::InvalidInput("container name cannot be empty".to_string())
    })?;
    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(RuntimeError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    Ok(())
}

/// Validate an environment variable key (POSIX conventions).
fn validate_env_var_key(key: &str) -> RuntimeResult<()> {
    if key.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }

    let mut chars = key.chars();
    let first_char = chars.next().ok_or_else(|| {
        RuntimeError::InvalidInput("environment variable key cannot be empty".to_string())
    })?;
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(RuntimeError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RuntimeError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a host volume path.
fn validate_volume_path(path: &str) -> RuntimeResult<()> {
    if path.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "volume path cannot be empty".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(RuntimeError::InvalidInput(
            "volume path cannot contain null bytes".to_string(),
        ));
    }

    let dangerous_chars = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
        '\'', '\n', '\r',
    ];
    for c in dangerous_chars.iter() {
        if path.contains(*c) {
            return Err(RuntimeError::InvalidInput(format!(
                "volume path contains dangerous character '{}'",
                c
            )));
        }
    }

    Ok(())
}
