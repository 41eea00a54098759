//! Control channel wire protocol.
//!
//! Every frame is a JSON object `{ "event": <name>, "data": <payload> }`.
//! Inbound events are `authenticate`, `host`, `health`, and `console`;
//! outbound events are `authenticated`, `healthLog`, and `console`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::HostAuth;
use crate::telemetry::HealthSample;

/// Raw inbound frame before event dispatch.
#[derive(Debug, Deserialize)]
struct RawMessage {
    event: String,
    #[serde(default)]
    data: Value,
}

/// A parsed inbound control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Must be the first message on every connection.
    Authenticate(Value),
    /// Admin: provision (or re-provision) a host.
    Host(HostAuth),
    /// Tenant: subscribe to the host's health log.
    Health,
    /// Tenant: subscribe to the host's console output.
    Console,
    /// Either scope: end the session.
    Disconnect,
}

impl ClientMessage {
    /// Parse one frame. Unknown events and malformed payloads are `None`;
    /// the caller treats both as protocol violations.
    pub fn parse(text: &str) -> Option<Self> {
        let raw: RawMessage = serde_json::from_str(text).ok()?;
        match raw.event.as_str() {
            "authenticate" => Some(ClientMessage::Authenticate(raw.data)),
            "host" => serde_json::from_value(raw.data).ok().map(ClientMessage::Host),
            "health" => Some(ClientMessage::Health),
            "console" => Some(ClientMessage::Console),
            "disconnect" => Some(ClientMessage::Disconnect),
            _ => None,
        }
    }
}

/// An outbound control message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges a successful authenticate.
    Authenticated,
    /// One health sample for the session's host.
    HealthLog(HealthSample),
    /// One console output line from the session's host.
    Console(String),
}

/// Parsed authenticate payload.
///
/// The payload is a closed tagged union: exactly one of the three shapes
/// below. Anything else is a rejection, never a fallthrough to a weaker
/// tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Empty payload; admin scope is granted only to trusted origins.
    Anonymous,
    /// Machine enrollment secret; admin scope.
    Machine { hash: String },
    /// Tenant host secret; tenant scope bound to the matching host.
    Tenant { secret: String },
}

impl Credentials {
    /// Parse an authenticate payload. `None` means malformed.
    pub fn parse(data: &Value) -> Option<Self> {
        match data {
            Value::Null => Some(Credentials::Anonymous),
            Value::Object(map) if map.is_empty() => Some(Credentials::Anonymous),
            Value::Object(map) if map.len() == 1 => {
                let (key, value) = map.iter().next()?;
                let value = value.as_str()?;
                match key.as_str() {
                    "hash" => Some(Credentials::Machine {
                        hash: value.to_string(),
                    }),
                    "auth" => Some(Credentials::Tenant {
                        secret: value.to_string(),
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
