//! Hostwarden library
//!
//! Core components of the host-side agent for the hostwarden container
//! hosting platform: the authorized-host registry, the provisioning
//! pipeline, local-state reconciliation, health telemetry, and the
//! tiered-auth control channel.

pub mod channel;
pub mod identity;
pub mod naming;
pub mod provision;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod settings;
pub mod telemetry;
