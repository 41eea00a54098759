//! Control channel server.
//!
//! One WebSocket listener serves both tiers of the platform: admin
//! connections (the control plane, or a trusted panel origin) and tenant
//! connections (hosted-service owners). The first message on every
//! connection must be `authenticate`; everything afterwards is dispatched
//! against the scope that authentication established. Scope violations and
//! malformed credentials disconnect immediately with no detail.

mod session;
mod tls;
mod types;

pub use session::{Scope, SessionId, SessionRegistry};
pub use types::{ClientMessage, Credentials, ServerMessage};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use crate::naming;
use crate::provision::Provisioner;
use crate::registry::HostAuthRegistry;
use crate::runtime::ContainerRuntimeApi;
use crate::telemetry::HealthTelemetry;
use tls::MaybeTls;

/// Size of the per-connection outbound buffer.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Control channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Listen port for both tiers.
    pub port: u16,
    /// Origin hosts granted admin scope without credentials.
    pub admin_origins: Vec<String>,
    /// This machine's enrollment secret; grants admin scope.
    pub enrollment_hash: String,
    /// Letsencrypt-style live directory scanned for certificates.
    pub cert_root: PathBuf,
}

/// The host part of an Origin header value.
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map(|(_, r)| r).unwrap_or(origin);
    let host = rest.split(['/', ':']).next()?;
    if host.is_empty() { None } else { Some(host) }
}

pub struct ControlChannel {
    config: ChannelConfig,
    registry: HostAuthRegistry,
    provisioner: Arc<Provisioner>,
    telemetry: Arc<HealthTelemetry>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    sessions: Arc<SessionRegistry>,
}

impl ControlChannel {
    pub fn new(
        config: ChannelConfig,
        registry: HostAuthRegistry,
        provisioner: Arc<Provisioner>,
        telemetry: Arc<HealthTelemetry>,
        runtime: Arc<dyn ContainerRuntimeApi>,
    ) -> Self {
        Self {
            config,
            registry,
            provisioner,
            telemetry,
            runtime,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Accept connections forever.
    ///
    /// TLS is preferred: when the cert scan finds a usable pair the
    /// listener speaks TLS, otherwise it stays plaintext.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let acceptor = match tls::discover_certificates(&self.config.cert_root) {
            Some(paths) => match tls::load_server_config(&paths) {
                Ok(config) => {
                    info!("control channel using TLS ({})", paths.cert.display());
                    Some(TlsAcceptor::from(config))
                }
                Err(e) => {
                    warn!("could not load certificates, serving plaintext: {e:#}");
                    None
                }
            },
            None => {
                warn!("no certificates found, control channel serving plaintext");
                None
            }
        };

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("binding control channel port {}", self.config.port))?;
        info!("control channel listening on port {}", self.config.port);

        self.serve_listener(listener, acceptor).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        loop {
            let (tcp, peer) = listener.accept().await.context("accepting connection")?;
            let channel = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let stream = match acceptor {
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(tls) => MaybeTls::Tls(Box::new(tls)),
                        Err(e) => {
                            debug!("TLS handshake with {peer} failed: {e}");
                            return;
                        }
                    },
                    None => MaybeTls::Plain(tcp),
                };
                if let Err(e) = channel.handle_connection(stream).await {
                    debug!("connection from {peer} ended: {e:#}");
                }
            });
        }
    }

    /// Authenticate a connection's first message into a scope.
    ///
    /// `None` is a rejection; callers disconnect without detail.
    async fn scope_for(&self, credentials: Credentials, origin: Option<&str>) -> Option<Scope> {
        match credentials {
            Credentials::Anonymous => {
                let host = origin.and_then(origin_host)?;
                if self.config.admin_origins.iter().any(|o| o == host) {
                    Some(Scope::Admin)
                } else {
                    None
                }
            }
            Credentials::Machine { hash } => {
                if !self.config.enrollment_hash.is_empty() && hash == self.config.enrollment_hash {
                    Some(Scope::Admin)
                } else {
                    None
                }
            }
            Credentials::Tenant { secret } => self
                .registry
                .find_by_secret(&secret)
                .await
                .map(|auth| Scope::Tenant(auth.host.uuid)),
        }
    }

    async fn handle_connection(self: &Arc<Self>, stream: MaybeTls) -> Result<()> {
        let mut origin: Option<String> = None;
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
            origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        })
        .await
        .context("websocket handshake")?;

        let (mut sink, mut inbound) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let Ok(json) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let id = self.sessions.next_id();
        let result = self
            .run_session(id, &mut inbound, &out_tx, origin.as_deref())
            .await;

        self.sessions.disconnect(id);
        drop(out_tx);
        writer.abort();
        result
    }

    async fn run_session<S>(
        self: &Arc<Self>,
        id: SessionId,
        inbound: &mut S,
        out_tx: &mpsc::Sender<ServerMessage>,
        origin: Option<&str>,
    ) -> Result<()>
    where
        S: StreamExt<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin,
    {
        // First message must authenticate
        let Some(text) = next_text(inbound).await else {
            return Ok(());
        };
        let Some(ClientMessage::Authenticate(payload)) = ClientMessage::parse(&text) else {
            return Ok(());
        };
        let Some(credentials) = Credentials::parse(&payload) else {
            return Ok(());
        };
        let Some(scope) = self.scope_for(credentials, origin).await else {
            return Ok(());
        };

        match &scope {
            Scope::Admin => self.sessions.set_admin(id),
            Scope::Tenant(uuid) => self.sessions.set_tenant(id, uuid),
        }
        let _ = out_tx.send(ServerMessage::Authenticated).await;

        while let Some(text) = next_text(inbound).await {
            let Some(message) = ClientMessage::parse(&text) else {
                // Protocol violation ends the session
                break;
            };
            match (message, &scope) {
                (ClientMessage::Host(auth), Scope::Admin) => {
                    if !self.registry.upsert(auth.clone()).await {
                        warn!("session {id} sent host with malformed uuid, ignoring");
                        continue;
                    }
                    // Provisioning outlives the connection that asked for it
                    let provisioner = Arc::clone(&self.provisioner);
                    tokio::spawn(async move {
                        if let Err(e) = provisioner.provision(&auth).await {
                            warn!("provisioning host {}: {e}", auth.host.uuid);
                        }
                    });
                }
                (ClientMessage::Health, Scope::Tenant(uuid)) => {
                    let Some((history, mut live)) = self.telemetry.subscribe(uuid).await else {
                        debug!("session {id} requested health for untracked host {uuid}");
                        continue;
                    };
                    let tx = out_tx.clone();
                    let task = tokio::spawn(async move {
                        for sample in history {
                            if tx.send(ServerMessage::HealthLog(sample)).await.is_err() {
                                return;
                            }
                        }
                        while let Ok(sample) = live.recv().await {
                            if tx.send(ServerMessage::HealthLog(sample)).await.is_err() {
                                return;
                            }
                        }
                    });
                    self.sessions.add_subscription(id, task);
                }
                (ClientMessage::Console, Scope::Tenant(uuid)) => {
                    let name = naming::managed_name(uuid);
                    let mut lines = match self.runtime.log_stream(&name).await {
                        Ok(lines) => lines,
                        Err(e) => {
                            warn!("console stream for {name}: {e}");
                            continue;
                        }
                    };
                    let tx = out_tx.clone();
                    let task = tokio::spawn(async move {
                        while let Some(line) = lines.recv().await {
                            if tx.send(ServerMessage::Console(line)).await.is_err() {
                                return;
                            }
                        }
                    });
                    self.sessions.add_subscription(id, task);
                }
                (ClientMessage::Disconnect, _) => break,
                (ClientMessage::Authenticate(_), _) => {
                    // Already authenticated; re-auth is a violation
                    break;
                }
                // A command outside the session's scope ends the session
                _ => break,
            }
        }

        Ok(())
    }
}

/// Next text frame from the socket, or `None` once it closes or errors.
async fn next_text<S>(inbound: &mut S) -> Option<String>
where
    S: StreamExt<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin,
{
    while let Some(message) = inbound.next().await {
        match message {
            Ok(message) => {
                if message.is_close() {
                    return None;
                }
                if let Ok(text) = message.to_text()
                    && !text.is_empty()
                {
                    return Some(text.to_string());
                }
            }
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_host_extraction() {
        assert_eq!(origin_host("https://panel.example.com"), Some("panel.example.com"));
        assert_eq!(
            origin_host("https://panel.example.com:8443/path"),
            Some("panel.example.com")
        );
        assert_eq!(origin_host("panel.example.com"), Some("panel.example.com"));
        assert_eq!(origin_host(""), None);
        assert_eq!(origin_host("https://"), None);
    }
}
