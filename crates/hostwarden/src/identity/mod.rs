//! Linux identity management for tenant isolation.
//!
//! Every tenant host owns a dedicated Linux user named by the shared
//! `hw-<uuid>` rule. Users are created with a disabled login shell and a
//! password set from the host's auth secret, and share one platform group.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::naming;

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Errors that can occur during identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A name that does not follow the managed naming rule.
    #[error("invalid managed name: {0}")]
    InvalidName(String),

    /// A user-management command failed.
    #[error("identity {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for Linux identity management.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Shared group for all tenant users. Created if it doesn't exist.
    pub group: String,
    /// Login shell for tenant users. Disabled by default.
    pub shell: String,
    /// Use sudo when not running as root.
    pub use_sudo: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            group: "hostwarden".to_string(),
            shell: "/usr/sbin/nologin".to_string(),
            use_sudo: true,
        }
    }
}

/// OS identity abstraction for testability.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Ensure the shared tenant group exists.
    async fn ensure_group(&self) -> IdentityResult<()>;

    /// Ensure the tenant user for `uuid` exists with `home` as its home
    /// directory and its password set to `secret`.
    ///
    /// Idempotent: an existing user gets its home ownership re-applied so
    /// a half-finished earlier attempt converges.
    async fn ensure_user(&self, uuid: &str, secret: &str, home: &Path) -> IdentityResult<()>;

    /// Remove the tenant user for `uuid`, forcing removal of running
    /// processes. The home directory is left in place for quarantine.
    async fn remove_user(&self, uuid: &str) -> IdentityResult<()>;
}

/// Identity store backed by the host's shadow utilities.
#[derive(Debug, Clone, Default)]
pub struct LinuxIdentityStore {
    config: IdentityConfig,
}

impl LinuxIdentityStore {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    fn username(uuid: &str) -> IdentityResult<String> {
        if !naming::is_valid_uuid(uuid) {
            return Err(IdentityError::InvalidName(uuid.to_string()));
        }
        Ok(naming::managed_name(uuid))
    }

    fn privileged(&self, cmd: &str) -> Command {
        let is_root = unsafe { libc::geteuid() } == 0;
        if self.config.use_sudo && !is_root {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(cmd);
            command
        } else {
            Command::new(cmd)
        }
    }

    async fn run_privileged(&self, cmd: &str, args: &[&str]) -> IdentityResult<()> {
        debug!("running {} {:?}", cmd, args);
        let output = self
            .privileged(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| IdentityError::CommandFailed {
                command: cmd.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IdentityError::CommandFailed {
                command: cmd.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// Set the user's password via chpasswd, feeding `user:secret` on stdin
    /// so the secret never appears in an argument list.
    async fn set_password(&self, username: &str, secret: &str) -> IdentityResult<()> {
        let mut child = self
            .privileged("chpasswd")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| IdentityError::CommandFailed {
                command: "chpasswd".to_string(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{username}:{secret}\n").as_bytes())
                .await?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| IdentityError::CommandFailed {
                command: "chpasswd".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IdentityError::CommandFailed {
                command: "chpasswd".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Check if a Linux user exists.
async fn user_exists(username: &str) -> bool {
    Command::new("id")
        .args(["-u", username])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check if a group exists.
async fn group_exists(group: &str) -> IdentityResult<bool> {
    let status = Command::new("getent")
        .args(["group", group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| IdentityError::CommandFailed {
            command: "getent".to_string(),
            message: e.to_string(),
        })?;

    Ok(status.success())
}

#[async_trait]
impl IdentityStore for LinuxIdentityStore {
    async fn ensure_group(&self) -> IdentityResult<()> {
        if group_exists(&self.config.group).await? {
            debug!("group '{}' already exists", self.config.group);
            return Ok(());
        }

        info!("creating group '{}'", self.config.group);
        self.run_privileged("groupadd", &[&self.config.group]).await
    }

    async fn ensure_user(&self, uuid: &str, secret: &str, home: &Path) -> IdentityResult<()> {
        let username = Self::username(uuid)?;
        let home_str = home.to_string_lossy();
        let owner = format!("{}:{}", username, self.config.group);

        if user_exists(&username).await {
            debug!("user '{}' already exists", username);
            // Re-apply ownership so an interrupted earlier attempt converges
            self.run_privileged("chown", &["-R", &owner, &home_str])
                .await?;
            return Ok(());
        }

        info!("creating tenant user '{}'", username);
        self.run_privileged(
            "useradd",
            &[
                "-g",
                &self.config.group,
                "-s",
                &self.config.shell,
                "-m",
                "-d",
                &home_str,
                &username,
            ],
        )
        .await?;

        self.set_password(&username, secret).await?;
        self.run_privileged("chown", &["-R", &owner, &home_str])
            .await?;

        Ok(())
    }

    async fn remove_user(&self, uuid: &str) -> IdentityResult<()> {
        let username = Self::username(uuid)?;

        if !user_exists(&username).await {
            debug!("user '{}' already gone", username);
            return Ok(());
        }

        info!("removing tenant user '{}'", username);
        self.run_privileged("userdel", &["-f", &username]).await
    }
}
