//! Shared fixtures: in-memory runtime and identity mocks.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;

use hostwarden::identity::{IdentityError, IdentityResult, IdentityStore};
use hostwarden::registry::{HostAuth, HostSpec, HostTemplate};
use hostwarden::runtime::{
    Container, ContainerRuntimeApi, ContainerState, ContainerStats, HostingConfig, RuntimeError,
    RuntimeResult,
};

pub fn host_auth(uuid: &str, hash: &str) -> HostAuth {
    HostAuth {
        host: HostSpec {
            uuid: uuid.to_string(),
            image: "hosting/base:latest".to_string(),
            port: 40001,
            template: HostTemplate {
                memory: 2 * 1024 * 1024 * 1024,
                cores: 2,
                size: 10 * 1024 * 1024 * 1024,
            },
        },
        hash: hash.to_string(),
    }
}

pub fn container(name: &str, state: ContainerState) -> Container {
    let json = format!(
        r#"{{"Id":"{name}-id","Names":"{name}","Image":"hosting/base:latest","State":"{state}","Status":""}}"#
    );
    serde_json::from_str(&json).expect("container fixture")
}

/// In-memory container runtime. Records every call; `fail_create` errors
/// are consumed one per create attempt before creation succeeds.
#[derive(Default)]
pub struct MockRuntime {
    pub containers: Mutex<Vec<Container>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_create: Mutex<Vec<RuntimeError>>,
    pub fail_remove: Mutex<bool>,
    stats_tx: Mutex<Vec<mpsc::Sender<ContainerStats>>>,
    log_tx: Mutex<Vec<mpsc::Sender<String>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_containers(containers: Vec<Container>) -> Self {
        let runtime = Self::default();
        *runtime.containers.lock().unwrap() = containers;
        runtime
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.name().map(str::to_string))
            .collect()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl ContainerRuntimeApi for MockRuntime {
    async fn ping(&self) -> RuntimeResult<String> {
        self.record("ping");
        Ok("mock-runtime 1.0".to_string())
    }

    async fn create_container(&self, config: &HostingConfig) -> RuntimeResult<String> {
        self.record(format!(
            "create {} storage={:?}",
            config.name, config.storage_bytes
        ));
        if let Some(err) = self.fail_create.lock().unwrap().pop() {
            return Err(err);
        }
        self.containers
            .lock()
            .unwrap()
            .push(container(&config.name, ContainerState::Created));
        Ok(format!("{}-id", config.name))
    }

    async fn start_container(&self, id_or_name: &str) -> RuntimeResult<()> {
        self.record(format!("start {id_or_name}"));
        let mut containers = self.containers.lock().unwrap();
        match containers
            .iter_mut()
            .find(|c| c.name() == Some(id_or_name) || c.id == id_or_name)
        {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(id_or_name.to_string())),
        }
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> RuntimeResult<()> {
        self.record(format!("remove {id_or_name} force={force}"));
        if *self.fail_remove.lock().unwrap() {
            return Err(RuntimeError::CommandFailed {
                command: "rm".to_string(),
                message: "device busy".to_string(),
            });
        }
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.name() != Some(id_or_name) && c.id != id_or_name);
        if containers.len() == before {
            return Err(RuntimeError::ContainerNotFound(id_or_name.to_string()));
        }
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<Container>> {
        self.record(format!("list all={all}"));
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .iter()
            .filter(|c| all || c.state == ContainerState::Running)
            .cloned()
            .collect())
    }

    async fn stats_stream(
        &self,
        id_or_name: &str,
    ) -> RuntimeResult<mpsc::Receiver<ContainerStats>> {
        self.record(format!("stats {id_or_name}"));
        let (tx, rx) = mpsc::channel(16);
        self.stats_tx.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn log_stream(&self, id_or_name: &str) -> RuntimeResult<mpsc::Receiver<String>> {
        self.record(format!("logs {id_or_name}"));
        let (tx, rx) = mpsc::channel(16);
        self.log_tx.lock().unwrap().push(tx);
        Ok(rx)
    }
}

impl MockRuntime {
    /// Sender feeding the most recent stats subscription.
    pub fn latest_stats_sender(&self) -> Option<mpsc::Sender<ContainerStats>> {
        self.stats_tx.lock().unwrap().last().cloned()
    }

    /// Sender feeding the most recent log subscription.
    pub fn latest_log_sender(&self) -> Option<mpsc::Sender<String>> {
        self.log_tx.lock().unwrap().last().cloned()
    }
}

/// In-memory identity store.
#[derive(Default)]
pub struct MockIdentity {
    pub users: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_remove: Mutex<bool>,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_user(&self, uuid: &str) -> bool {
        self.users.lock().unwrap().contains(uuid)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl IdentityStore for MockIdentity {
    async fn ensure_group(&self) -> IdentityResult<()> {
        self.record("ensure_group");
        Ok(())
    }

    async fn ensure_user(&self, uuid: &str, _secret: &str, _home: &Path) -> IdentityResult<()> {
        self.record(format!("ensure_user {uuid}"));
        self.users.lock().unwrap().insert(uuid.to_string());
        Ok(())
    }

    async fn remove_user(&self, uuid: &str) -> IdentityResult<()> {
        self.record(format!("remove_user {uuid}"));
        if *self.fail_remove.lock().unwrap() {
            return Err(IdentityError::CommandFailed {
                command: "userdel".to_string(),
                message: "user busy".to_string(),
            });
        }
        self.users.lock().unwrap().remove(uuid);
        Ok(())
    }
}
