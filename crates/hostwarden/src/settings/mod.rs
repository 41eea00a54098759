//! Agent configuration and enrollment settings.
//!
//! Two layers: the agent config (TOML file plus `HOSTWARDEN_` environment
//! overrides, merged over defaults) and the enrollment settings file, a
//! small JSON document holding the machine's enrollment secret. The latter
//! is written once by `hostwarden enroll` and must exist before `serve`
//! will start.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::identity::IdentityConfig;
use crate::runtime::RuntimeType;

/// Default agent config location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostwarden/config.toml";

/// Result type for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors loading or saving configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "no enrollment settings at {0}; enroll this machine first with \
         `hostwarden enroll --hash <secret>`"
    )]
    NotEnrolled(PathBuf),
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the control-plane registry.
    pub registry_url: String,
    /// Control channel listen port.
    pub listen_port: u16,
    /// Service port inside every hosting container.
    pub service_port: u16,
    /// Root of tenant home directories.
    pub hosted_root: PathBuf,
    /// Where decorrelated directories are renamed to.
    pub quarantine_root: PathBuf,
    /// Letsencrypt-style live directory scanned for certificates.
    pub cert_root: PathBuf,
    /// Origin hosts granted admin scope without credentials.
    pub admin_origins: Vec<String>,
    /// Enrollment settings file location.
    pub settings_path: PathBuf,
    /// Container runtime override; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Linux identity management.
    pub identity: IdentityConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://127.0.0.1:8080".to_string(),
            listen_port: 31518,
            service_port: 25565,
            hosted_root: PathBuf::from("/var/lib/hostwarden/hosted"),
            quarantine_root: PathBuf::from("/var/lib/hostwarden/quarantine"),
            cert_root: PathBuf::from("/etc/letsencrypt/live"),
            admin_origins: Vec::new(),
            settings_path: PathBuf::from("/etc/hostwarden/settings.json"),
            runtime: None,
            identity: IdentityConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration: defaults, then the config file (optional unless
    /// explicitly given), then `HOSTWARDEN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> SettingsResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&AgentConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::from(Path::new(DEFAULT_CONFIG_PATH)).required(false)),
        };

        let config = builder
            .add_source(Environment::with_prefix("HOSTWARDEN").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// The machine's enrollment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentSettings {
    /// Secret identifying this machine to the control plane.
    pub hash: String,
}

impl EnrollmentSettings {
    /// Load enrollment settings; a missing file is a startup error that
    /// tells the operator how to enroll.
    pub fn load(path: &Path) -> SettingsResult<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SettingsError::NotEnrolled(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    /// Persist enrollment settings, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> SettingsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
