//! Reconciliation of local state against the authorized-host registry.
//!
//! Managed containers whose tenant is no longer registered are removed
//! (identity first, then the container). Hosted directories that no longer
//! correlate with a surviving container or a registered host are renamed
//! into quarantine instead of deleted, so tenant data survives operator
//! mistakes. Resources that do not follow the managed naming rule are
//! never touched.

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::identity::IdentityStore;
use crate::naming;
use crate::registry::HostAuthRegistry;
use crate::runtime::ContainerRuntimeApi;

/// What one reconciliation pass did.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Uuids whose containers were removed.
    pub removed_containers: Vec<String>,
    /// Quarantine entries created, as (original name, quarantine name).
    pub quarantined: Vec<(String, String)>,
    /// Per-item failures; none of these abort the pass.
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass changed anything or hit any error.
    pub fn is_clean(&self) -> bool {
        self.removed_containers.is_empty() && self.quarantined.is_empty() && self.errors.is_empty()
    }
}

/// Build a quarantine entry name for a decorrelated directory.
///
/// The random infix keeps repeated quarantines of a recreated directory
/// from colliding.
fn quarantine_name(original: &str) -> String {
    let suffix: [u8; 8] = rand::random();
    format!("noncorrelated-{}-{}", hex::encode(suffix), original)
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntimeApi>,
    identity: Arc<dyn IdentityStore>,
    registry: HostAuthRegistry,
    hosted_root: PathBuf,
    quarantine_root: PathBuf,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        identity: Arc<dyn IdentityStore>,
        registry: HostAuthRegistry,
        hosted_root: PathBuf,
        quarantine_root: PathBuf,
    ) -> Self {
        Self {
            runtime,
            identity,
            registry,
            hosted_root,
            quarantine_root,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Only listing failures abort; anything that goes wrong for a single
    /// container or directory lands in the report instead.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let containers = self
            .runtime
            .list_containers(true)
            .await
            .context("listing containers for reconciliation")?;
        let registered = self.registry.uuids().await;

        // Partition managed containers into surviving and stale
        let mut survivors: HashSet<String> = HashSet::new();
        let mut stale: Vec<(String, String)> = Vec::new();
        for container in &containers {
            let Some(uuid) = container.name().and_then(naming::extract_uuid) else {
                continue;
            };
            if registered.contains(uuid) {
                survivors.insert(uuid.to_string());
            } else {
                stale.push((uuid.to_string(), naming::managed_name(uuid)));
            }
        }

        // Issue every removal, then wait for all of them before touching
        // the filesystem. Identity goes first so no orphan user outlives
        // its container.
        let removals = stale.into_iter().map(|(uuid, name)| {
            let runtime = Arc::clone(&self.runtime);
            let identity = Arc::clone(&self.identity);
            async move {
                let mut errors = Vec::new();
                if let Err(e) = identity.remove_user(&uuid).await {
                    warn!("removing identity for stale host {uuid}: {e}");
                    errors.push(format!("identity {uuid}: {e}"));
                }
                match runtime.remove_container(&name, true).await {
                    Ok(()) => {
                        info!("removed stale container {name}");
                        (uuid, true, errors)
                    }
                    Err(e) => {
                        warn!("removing stale container {name}: {e}");
                        errors.push(format!("container {name}: {e}"));
                        (uuid, false, errors)
                    }
                }
            }
        });

        for (uuid, removed, errors) in join_all(removals).await {
            if removed {
                report.removed_containers.push(uuid);
            } else {
                // The container still exists; its directory stays
                // correlated and must not be quarantined this pass.
                survivors.insert(uuid);
            }
            report.errors.extend(errors);
        }

        self.sweep_hosted_dirs(&registered, &survivors, &mut report)
            .await?;

        Ok(report)
    }

    /// Quarantine hosted directories that correlate with nothing.
    async fn sweep_hosted_dirs(
        &self,
        registered: &HashSet<String>,
        survivors: &HashSet<String>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.hosted_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Nothing hosted yet
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("listing hosted root {}", self.hosted_root.display())
                });
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("reading hosted root entry")?
        {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy().into_owned();
            let Some(uuid) = naming::extract_uuid(&name) else {
                // Not a managed directory, never touched
                continue;
            };
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if registered.contains(uuid) || survivors.contains(uuid) {
                continue;
            }

            if let Err(e) = self.identity.remove_user(uuid).await {
                warn!("removing identity for decorrelated dir {name}: {e}");
                report.errors.push(format!("identity {uuid}: {e}"));
            }

            let quarantined = quarantine_name(&name);
            let target = self.quarantine_root.join(&quarantined);
            if let Err(e) = tokio::fs::create_dir_all(&self.quarantine_root).await {
                report
                    .errors
                    .push(format!("quarantine root: {e}"));
                continue;
            }
            match tokio::fs::rename(entry.path(), &target).await {
                Ok(()) => {
                    info!("quarantined decorrelated dir {name} as {quarantined}");
                    report.quarantined.push((name, quarantined));
                }
                Err(e) => {
                    warn!("quarantining dir {name}: {e}");
                    report.errors.push(format!("quarantine {name}: {e}"));
                }
            }
        }

        Ok(())
    }
}
