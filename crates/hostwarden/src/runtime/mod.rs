//! Container runtime management module.
//!
//! Provides an async interface to manage tenant hosting containers via the
//! Docker or Podman CLI. The runtime is auto-detected or can be configured
//! explicitly.

mod error;
mod types;

pub use error::{RuntimeError, RuntimeResult};
pub use types::{Container, ContainerState, ContainerStats, HostingConfig};

use types::validate_container_id_or_name;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

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

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Check that the runtime daemon is reachable; returns its version string.
    async fn ping(&self) -> RuntimeResult<String>;

    /// Create a hosting container without starting it. Returns the container ID.
    async fn create_container(&self, config: &HostingConfig) -> RuntimeResult<String>;

    async fn start_container(&self, id_or_name: &str) -> RuntimeResult<()>;

    async fn remove_container(&self, id_or_name: &str, force: bool) -> RuntimeResult<()>;

    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<Container>>;

    /// Subscribe to streaming stats frames for one container.
    ///
    /// The underlying process is killed when the receiver is dropped.
    async fn stats_stream(&self, id_or_name: &str) -> RuntimeResult<mpsc::Receiver<ContainerStats>>;

    /// Subscribe to the container's combined stdout/stderr log lines,
    /// following new output.
    async fn log_stream(&self, id_or_name: &str) -> RuntimeResult<mpsc::Receiver<String>>;
}

/// Container runtime client for managing tenant hosting containers.
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
            // Fall back to docker, will fail at the ping check
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

    async fn run(&self, command: &str, args: &[String]) -> RuntimeResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed {
                command: command.to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn ping(&self) -> RuntimeResult<String> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        self.run("version", &args).await
    }

    async fn create_container(&self, config: &HostingConfig) -> RuntimeResult<String> {
        config.validate()?;

        let mut args: Vec<String> = vec!["create".to_string()];

        args.push("--name".to_string());
        args.push(config.name.clone());

        args.push("-m".to_string());
        args.push(config.memory_bytes.to_string());

        args.push("--cpus".to_string());
        args.push(config.cpu_cores.to_string());

        if let Some(size) = config.storage_bytes {
            args.push("--storage-opt".to_string());
            args.push(format!("size={size}"));
        }

        args.push("--restart".to_string());
        args.push("unless-stopped".to_string());

        // Keep a TTY allocated so service consoles stay interactive
        args.push("-t".to_string());

        args.push("-p".to_string());
        args.push(format!("{}:{}", config.host_port, config.service_port));

        args.push("-v".to_string());
        if self.runtime_type.needs_selinux_labels() {
            args.push(format!("{}:/data:Z", config.data_dir));
        } else {
            args.push(format!("{}:/data", config.data_dir));
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());

        let stdout = self.run("create", &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start_container(&self, id_or_name: &str) -> RuntimeResult<()> {
        validate_container_id_or_name(id_or_name)?;

        let args = vec!["start".to_string(), id_or_name.to_string()];
        self.run("start", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> RuntimeResult<()> {
        validate_container_id_or_name(id_or_name)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id_or_name.to_string());

        self.run("rm", &args).await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<Container>> {
        let mut args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        if all {
            args.push("-a".to_string());
        }

        let stdout = self.run("ps", &args).await?;
        if stdout.trim().is_empty() {
            return Ok(vec![]);
        }

        // Podman emits a JSON array; docker emits one object per line.
        if stdout.trim_start().starts_with('[') {
            return serde_json::from_str(&stdout)
                .map_err(|e| RuntimeError::ParseError(e.to_string()));
        }

        let mut containers = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let container: Container = serde_json::from_str(line)
                .map_err(|e| RuntimeError::ParseError(e.to_string()))?;
            containers.push(container);
        }
        Ok(containers)
    }

    async fn stats_stream(
        &self,
        id_or_name: &str,
    ) -> RuntimeResult<mpsc::Receiver<ContainerStats>> {
        validate_container_id_or_name(id_or_name)?;

        let mut child = Command::new(&self.binary)
            .args(["stats", "--format", "json", id_or_name])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::CommandFailed {
                command: "stats".to_string(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::CommandFailed {
                command: "stats".to_string(),
                message: "no stdout pipe".to_string(),
            }
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // Terminal-refresh control codes may prefix the JSON object
                let Some(start) = line.find('{') else { continue };
                if let Ok(stats) = serde_json::from_str::<ContainerStats>(&line[start..])
                    && tx.send(stats).await.is_err()
                {
                    break;
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }

    async fn log_stream(&self, id_or_name: &str) -> RuntimeResult<mpsc::Receiver<String>> {
        validate_container_id_or_name(id_or_name)?;

        let mut child = Command::new(&self.binary)
            .args(["logs", "-f", "--tail", "100", id_or_name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::CommandFailed {
                command: "logs".to_string(),
                message: "no stdout pipe".to_string(),
            }
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RuntimeError::CommandFailed {
                command: "logs".to_string(),
                message: "no stderr pipe".to_string(),
            }
        })?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;
            // Container stderr comes through the logs command's stderr;
            // interleave both into one subscription.
            while out_open || err_open {
                let line = tokio::select! {
                    line = out_lines.next_line(), if out_open => {
                        match line {
                            Ok(Some(line)) => Some(line),
                            _ => {
                                out_open = false;
                                None
                            }
                        }
                    }
                    line = err_lines.next_line(), if err_open => {
                        match line {
                            Ok(Some(line)) => Some(line),
                            _ => {
                                err_open = false;
                                None
                            }
                        }
                    }
                };
                if let Some(line) = line
                    && tx.send(line).await.is_err()
                {
                    break;
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }
}
