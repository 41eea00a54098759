//! Tenant host provisioning.
//!
//! Provisioning runs a strict sequence: shared group, tenant data
//! directories, tenant user, container create, container start, telemetry
//! attach. Every step is idempotent, so re-provisioning an existing host
//! converges instead of failing.

use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::identity::{IdentityError, IdentityStore};
use crate::naming;
use crate::registry::HostAuth;
use crate::runtime::{ContainerRuntimeApi, HostingConfig, RuntimeError};
use crate::telemetry::HealthTelemetry;

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that can occur while provisioning a host.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("not a managed host uuid: {0}")]
    InvalidName(String),

    #[error("ensuring tenant group: {0}")]
    Group(#[source] IdentityError),

    #[error("creating host directories: {0}")]
    Directories(#[source] std::io::Error),

    #[error("ensuring tenant identity: {0}")]
    Identity(#[source] IdentityError),

    #[error("creating container: {0}")]
    Create(#[source] RuntimeError),

    #[error("starting container: {0}")]
    Start(#[source] RuntimeError),
}

/// Provisioner wiring the identity store, runtime, and telemetry together.
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntimeApi>,
    identity: Arc<dyn IdentityStore>,
    telemetry: Arc<HealthTelemetry>,
    hosted_root: PathBuf,
    /// Service port inside every hosting container.
    service_port: u16,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        identity: Arc<dyn IdentityStore>,
        telemetry: Arc<HealthTelemetry>,
        hosted_root: PathBuf,
        service_port: u16,
    ) -> Self {
        Self {
            runtime,
            identity,
            telemetry,
            hosted_root,
            service_port,
        }
    }

    fn hosting_config(&self, auth: &HostAuth) -> HostingConfig {
        let spec = &auth.host;
        HostingConfig {
            name: naming::managed_name(&spec.uuid),
            image: spec.image.clone(),
            memory_bytes: spec.template.memory,
            cpu_cores: spec.template.cores,
            storage_bytes: Some(spec.template.size),
            host_port: spec.port,
            service_port: self.service_port,
            data_dir: naming::data_dir(&self.hosted_root, &spec.uuid)
                .to_string_lossy()
                .into_owned(),
            env: Default::default(),
        }
    }

    /// Provision a host end to end.
    pub async fn provision(&self, auth: &HostAuth) -> ProvisionResult<()> {
        let uuid = &auth.host.uuid;
        if !naming::is_valid_uuid(uuid) {
            return Err(ProvisionError::InvalidName(uuid.clone()));
        }
        let name = naming::managed_name(uuid);
        info!("provisioning host {name}");

        self.identity
            .ensure_group()
            .await
            .map_err(ProvisionError::Group)?;

        // Directories first so the identity step's recursive chown covers
        // the data dir too
        let data_dir = naming::data_dir(&self.hosted_root, uuid);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(ProvisionError::Directories)?;

        let home = naming::home_dir(&self.hosted_root, uuid);
        self.identity
            .ensure_user(uuid, &auth.hash, &home)
            .await
            .map_err(ProvisionError::Identity)?;

        if !self.container_exists(&name).await? {
            self.create_with_quota_retry(auth).await?;
        } else {
            info!("container {name} already exists, skipping create");
        }

        self.runtime
            .start_container(&name)
            .await
            .map_err(ProvisionError::Start)?;

        // Telemetry is best-effort; the host is up either way
        if let Err(e) = self.telemetry.start_logging(uuid).await {
            warn!("could not attach telemetry for host {uuid}: {e}");
        }

        info!("provisioned host {name}");
        Ok(())
    }

    /// Remove the tenant's OS user. Container and data removal belong to
    /// reconciliation.
    pub async fn deprovision(&self, uuid: &str) -> ProvisionResult<()> {
        if !naming::is_valid_uuid(uuid) {
            return Err(ProvisionError::InvalidName(uuid.to_string()));
        }
        self.identity
            .remove_user(uuid)
            .await
            .map_err(ProvisionError::Identity)
    }

    async fn container_exists(&self, name: &str) -> ProvisionResult<bool> {
        let containers = self
            .runtime
            .list_containers(true)
            .await
            .map_err(ProvisionError::Create)?;
        Ok(containers
            .iter()
            .any(|c| c.names.iter().any(|n| n.trim_start_matches('/') == name)))
    }

    /// Create the container, retrying exactly once without the storage
    /// quota when the filesystem can't enforce one.
    async fn create_with_quota_retry(&self, auth: &HostAuth) -> ProvisionResult<String> {
        let config = self.hosting_config(auth);
        match self.runtime.create_container(&config).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_storage_quota_unsupported() => {
                warn!(
                    "storage quota unsupported on this filesystem, creating {} without one",
                    config.name
                );
                let retry = HostingConfig {
                    storage_bytes: None,
                    ..config
                };
                self.runtime
                    .create_container(&retry)
                    .await
                    .map_err(ProvisionError::Create)
            }
            Err(e) => Err(ProvisionError::Create(e)),
        }
    }
}
