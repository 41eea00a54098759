//! Authorized-host registry.
//!
//! The control plane is the source of truth for which tenant hosts this
//! machine may run. The agent pulls a snapshot at startup and keeps it in
//! an in-memory registry that the reconciler, provisioner, and control
//! channel all read.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::naming;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur talking to the control plane.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The enrollment secret was rejected.
    #[error("machine enrollment rejected by control plane")]
    Unauthorized,

    #[error("unexpected control plane response: {0}")]
    Decode(String),
}

/// Resource template for a tenant host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTemplate {
    /// Memory limit in bytes.
    pub memory: i64,
    /// CPU core limit.
    pub cores: u32,
    /// Storage size quota in bytes.
    pub size: i64,
}

/// A tenant host as the control plane describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Tenant uuid (16 lowercase hex chars).
    pub uuid: String,
    /// OCI image the host runs.
    pub image: String,
    /// Host port published for the service.
    pub port: u16,
    /// Resource limits.
    pub template: HostTemplate,
}

/// A host plus the secret its tenant authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    pub host: HostSpec,
    /// Tenant credential; compared verbatim against `auth` payloads.
    pub hash: String,
}

/// This machine's identity as resolved by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// HTTP client for the control-plane registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
    enrollment_hash: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, enrollment_hash: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            enrollment_hash: enrollment_hash.into(),
        }
    }

    /// Resolve this machine's identity from its enrollment secret.
    pub async fn resolve_machine(&self) -> RegistryResult<MachineIdentity> {
        let url = format!("{}/machines/resolve", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "hash": self.enrollment_hash }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized);
        }

        let response = response.error_for_status()?;
        let machine = response
            .json::<MachineIdentity>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(machine)
    }

    /// Fetch the snapshot of hosts this machine is authorized to run.
    pub async fn fetch_authorized_hosts(
        &self,
        machine_id: &str,
    ) -> RegistryResult<Vec<HostAuth>> {
        let url = format!("{}/machines/{}/hosts", self.base_url, machine_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.enrollment_hash)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized);
        }

        let response = response.error_for_status()?;
        let hosts = response
            .json::<Vec<HostAuth>>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(hosts)
    }
}

/// In-memory registry of authorized hosts, keyed by tenant uuid.
///
/// Hosts with malformed uuids are refused at insert, so every uuid in the
/// registry satisfies the managed naming rule.
#[derive(Debug, Default, Clone)]
pub struct HostAuthRegistry {
    hosts: Arc<RwLock<HashMap<String, HostAuth>>>,
}

impl HostAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a host. Returns false (and changes nothing) when
    /// the uuid does not follow the naming rule.
    pub async fn upsert(&self, auth: HostAuth) -> bool {
        if !naming::is_valid_uuid(&auth.host.uuid) {
            debug!("refusing host with malformed uuid '{}'", auth.host.uuid);
            return false;
        }
        self.hosts
            .write()
            .await
            .insert(auth.host.uuid.clone(), auth);
        true
    }

    /// Replace the whole registry with a fresh snapshot.
    ///
    /// Returns how many entries were refused for malformed uuids.
    pub async fn replace_all(&self, hosts: Vec<HostAuth>) -> usize {
        let mut refused = 0;
        let mut map = HashMap::with_capacity(hosts.len());
        for auth in hosts {
            if naming::is_valid_uuid(&auth.host.uuid) {
                map.insert(auth.host.uuid.clone(), auth);
            } else {
                debug!("refusing host with malformed uuid '{}'", auth.host.uuid);
                refused += 1;
            }
        }
        *self.hosts.write().await = map;
        refused
    }

    pub async fn get(&self, uuid: &str) -> Option<HostAuth> {
        self.hosts.read().await.get(uuid).cloned()
    }

    pub async fn contains(&self, uuid: &str) -> bool {
        self.hosts.read().await.contains_key(uuid)
    }

    /// The set of registered tenant uuids.
    pub async fn uuids(&self) -> HashSet<String> {
        self.hosts.read().await.keys().cloned().collect()
    }

    /// Find the host whose credential matches `secret` (tenant login path).
    pub async fn find_by_secret(&self, secret: &str) -> Option<HostAuth> {
        self.hosts
            .read()
            .await
            .values()
            .find(|auth| auth.hash == secret)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hosts.read().await.is_empty()
    }
}
