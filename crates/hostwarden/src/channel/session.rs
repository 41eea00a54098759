//! Control channel session registry.
//!
//! Tracks which connections hold admin scope, which hold tenant scope (and
//! for which host), and the subscription tasks each session has running.
//! Disconnect clears all of it synchronously.

use dashmap::{DashMap, DashSet};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;

/// Identifies one control channel connection.
pub type SessionId = u64;

/// The authority a session authenticated into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Admin,
    /// Tenant scope, bound to one host uuid.
    Tenant(String),
}

/// Registry of live control channel sessions.
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    admins: DashSet<SessionId>,
    tenants: DashMap<SessionId, String>,
    subscriptions: DashMap<SessionId, Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new connection.
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_admin(&self, id: SessionId) {
        self.admins.insert(id);
        info!("session {id} authenticated with admin scope");
    }

    pub fn set_tenant(&self, id: SessionId, uuid: &str) {
        self.tenants.insert(id, uuid.to_string());
        info!("session {id} authenticated for host {uuid}");
    }

    /// The session's scope, if it authenticated.
    pub fn scope(&self, id: SessionId) -> Option<Scope> {
        if self.admins.contains(&id) {
            return Some(Scope::Admin);
        }
        self.tenants.get(&id).map(|uuid| Scope::Tenant(uuid.clone()))
    }

    /// Attach a subscription task to a session; it is aborted on disconnect.
    pub fn add_subscription(&self, id: SessionId, task: JoinHandle<()>) {
        self.subscriptions.entry(id).or_default().push(task);
    }

    /// Remove the session from every scope set and abort its tasks.
    pub fn disconnect(&self, id: SessionId) {
        self.admins.remove(&id);
        self.tenants.remove(&id);
        if let Some((_, tasks)) = self.subscriptions.remove(&id) {
            for task in tasks {
                task.abort();
            }
        }
        info!("session {id} disconnected");
    }

    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let sessions = SessionRegistry::new();
        let a = sessions.next_id();
        let b = sessions.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn scope_tracks_tier() {
        let sessions = SessionRegistry::new();
        let admin = sessions.next_id();
        let tenant = sessions.next_id();
        let anon = sessions.next_id();

        sessions.set_admin(admin);
        sessions.set_tenant(tenant, "0123456789abcdef");

        assert_eq!(sessions.scope(admin), Some(Scope::Admin));
        assert_eq!(
            sessions.scope(tenant),
            Some(Scope::Tenant("0123456789abcdef".to_string()))
        );
        assert_eq!(sessions.scope(anon), None);
    }

    #[tokio::test]
    async fn disconnect_clears_scope_and_aborts_tasks() {
        let sessions = SessionRegistry::new();
        let id = sessions.next_id();
        sessions.set_tenant(id, "0123456789abcdef");

        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        sessions.add_subscription(id, task);

        sessions.disconnect(id);
        assert_eq!(sessions.scope(id), None);
        assert_eq!(sessions.tenant_count(), 0);

        // The subscription task was aborted, not left running
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(sessions.subscriptions.get(&id).is_none());
    }
}
