//! Streaming health telemetry for tenant hosts.
//!
//! Each tracked host owns a bounded sample buffer fed by the runtime's
//! streaming stats subscription. New samples fan out on a per-host
//! broadcast channel; buffered history is bounded to the last 24 hours.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::naming;
use crate::runtime::{ContainerRuntimeApi, ContainerStats, RuntimeError, RuntimeResult};

/// How long samples are retained.
const RETENTION_HOURS: i64 = 24;

/// Size of the per-host broadcast channel.
const SAMPLE_BUFFER_SIZE: usize = 64;

/// One timestamped stats frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub stats: ContainerStats,
}

/// Drop samples older than the retention window, measured from `now`.
///
/// The buffer is append-only at the tail, so only the head needs checking.
fn prune_expired(samples: &mut VecDeque<HealthSample>, now: DateTime<Utc>) {
    let cutoff = now - Duration::hours(RETENTION_HOURS);
    while let Some(head) = samples.front() {
        if head.at < cutoff {
            samples.pop_front();
        } else {
            break;
        }
    }
}

/// Buffer and fan-out state for one tracked host.
struct HostHealthLog {
    samples: Arc<Mutex<VecDeque<HealthSample>>>,
    tx: broadcast::Sender<HealthSample>,
    task: JoinHandle<()>,
}

impl Drop for HostHealthLog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Health telemetry hub: tracked hosts keyed by tenant uuid.
pub struct HealthTelemetry {
    runtime: Arc<dyn ContainerRuntimeApi>,
    logs: DashMap<String, HostHealthLog>,
}

impl HealthTelemetry {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self {
            runtime,
            logs: DashMap::new(),
        }
    }

    /// Start (or restart) streaming stats for a host.
    ///
    /// A host already being tracked gets its previous buffer discarded and
    /// its stream task aborted, so a restarted container never mixes
    /// samples from two lifetimes.
    pub async fn start_logging(&self, uuid: &str) -> RuntimeResult<()> {
        if !naming::is_valid_uuid(uuid) {
            return Err(RuntimeError::InvalidInput(format!(
                "not a managed host uuid: {uuid}"
            )));
        }

        let name = naming::managed_name(uuid);
        let mut stream = self.runtime.stats_stream(&name).await?;

        let samples = Arc::new(Mutex::new(VecDeque::new()));
        let (tx, _) = broadcast::channel(SAMPLE_BUFFER_SIZE);

        let task_samples = Arc::clone(&samples);
        let task_tx = tx.clone();
        let task_uuid = uuid.to_string();
        let task = tokio::spawn(async move {
            while let Some(stats) = stream.recv().await {
                let sample = HealthSample {
                    at: Utc::now(),
                    stats,
                };
                {
                    let mut buf = task_samples.lock().await;
                    buf.push_back(sample.clone());
                    prune_expired(&mut buf, sample.at);
                }
                // No receivers is fine; history still accumulates
                let _ = task_tx.send(sample);
            }
            debug!("stats stream for {} ended", task_uuid);
        });

        // Replacing the entry drops the old log, which aborts its task
        if self
            .logs
            .insert(uuid.to_string(), HostHealthLog { samples, tx, task })
            .is_some()
        {
            info!("replaced health log for host {uuid}");
        } else {
            info!("started health log for host {uuid}");
        }

        Ok(())
    }

    /// Stop tracking a host and discard its history.
    pub fn stop_logging(&self, uuid: &str) {
        if self.logs.remove(uuid).is_some() {
            info!("stopped health log for host {uuid}");
        }
    }

    /// Whether a host is currently tracked.
    pub fn is_tracking(&self, uuid: &str) -> bool {
        self.logs.contains_key(uuid)
    }

    /// Snapshot of a host's buffered samples plus a live subscription.
    pub async fn subscribe(
        &self,
        uuid: &str,
    ) -> Option<(Vec<HealthSample>, broadcast::Receiver<HealthSample>)> {
        let entry = self.logs.get(uuid)?;
        let history = entry.samples.lock().await.iter().cloned().collect();
        Some((history, entry.tx.subscribe()))
    }

    /// Start logging for every running managed container.
    ///
    /// Startup path: containers that survived reconciliation resume
    /// telemetry without waiting for a provisioning event. Returns the
    /// number of hosts now tracked; per-host failures are logged.
    pub async fn attach_existing(&self) -> RuntimeResult<usize> {
        let containers = self.runtime.list_containers(false).await?;
        let mut attached = 0;
        for container in containers {
            let Some(uuid) = container.name().and_then(naming::extract_uuid) else {
                continue;
            };
            match self.start_logging(uuid).await {
                Ok(()) => attached += 1,
                Err(e) => warn!("could not attach telemetry for host {uuid}: {e}"),
            }
        }
        Ok(attached)
    }
}
