//! Control channel protocol tests over a real listener.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::ClientRequestBuilder;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use common::{MockIdentity, MockRuntime, host_auth};
use hostwarden::channel::{ChannelConfig, ControlChannel};
use hostwarden::identity::IdentityStore;
use hostwarden::provision::Provisioner;
use hostwarden::registry::HostAuthRegistry;
use hostwarden::runtime::ContainerRuntimeApi;
use hostwarden::telemetry::HealthTelemetry;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MACHINE_HASH: &str = "m4chine-s3cret";
const TRUSTED_ORIGIN: &str = "panel.example.com";

struct Server {
    addr: std::net::SocketAddr,
    runtime: Arc<MockRuntime>,
    registry: HostAuthRegistry,
    telemetry: Arc<HealthTelemetry>,
    _hosted: TempDir,
}

async fn server() -> Server {
    let runtime = Arc::new(MockRuntime::new());
    let identity = Arc::new(MockIdentity::new());
    let registry = HostAuthRegistry::new();
    let hosted = TempDir::new().unwrap();
    let telemetry = Arc::new(HealthTelemetry::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntimeApi>
    ));
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntimeApi>,
        identity as Arc<dyn IdentityStore>,
        Arc::clone(&telemetry),
        hosted.path().to_path_buf(),
        25565,
    ));

    let channel = Arc::new(ControlChannel::new(
        ChannelConfig {
            port: 0,
            admin_origins: vec![TRUSTED_ORIGIN.to_string()],
            enrollment_hash: MACHINE_HASH.to_string(),
            cert_root: PathBuf::from("/nonexistent"),
        },
        registry.clone(),
        provisioner,
        Arc::clone(&telemetry),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntimeApi>,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = channel.serve_listener(listener, None).await;
    });

    Server {
        addr,
        runtime,
        registry,
        telemetry,
        _hosted: hosted,
    }
}

async fn connect(server: &Server) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{}", server.addr)).await.unwrap();
    ws
}

async fn connect_with_origin(server: &Server, origin: &str) -> WsClient {
    let uri: Uri = format!("ws://{}", server.addr).parse().unwrap();
    let request = ClientRequestBuilder::new(uri).with_header("Origin", origin);
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn send(ws: &mut WsClient, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next JSON frame, or `None` once the server closes the connection.
async fn next_json(ws: &mut WsClient) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within two seconds")?;
        let message = frame.ok()?;
        if message.is_close() {
            return None;
        }
        if let Ok(text) = message.to_text()
            && !text.is_empty()
        {
            return serde_json::from_str(text).ok();
        }
    }
}

async fn authenticate(ws: &mut WsClient, data: Value) -> Option<Value> {
    send(ws, json!({ "event": "authenticate", "data": data })).await;
    next_json(ws).await
}

#[tokio::test]
async fn machine_hash_grants_admin() {
    let server = server().await;
    let mut ws = connect(&server).await;

    let ack = authenticate(&mut ws, json!({ "hash": MACHINE_HASH })).await;
    assert_eq!(ack, Some(json!({ "event": "authenticated" })));
}

#[tokio::test]
async fn wrong_hash_disconnects_without_detail() {
    let server = server().await;
    let mut ws = connect(&server).await;

    let ack = authenticate(&mut ws, json!({ "hash": "wrong" })).await;
    assert_eq!(ack, None);
}

#[tokio::test]
async fn trusted_origin_grants_admin_without_credentials() {
    let server = server().await;

    let mut ws = connect_with_origin(&server, &format!("https://{TRUSTED_ORIGIN}")).await;
    let ack = authenticate(&mut ws, Value::Null).await;
    assert_eq!(ack, Some(json!({ "event": "authenticated" })));

    let mut ws = connect_with_origin(&server, "https://evil.example.com").await;
    let ack = authenticate(&mut ws, Value::Null).await;
    assert_eq!(ack, None);

    // No origin at all is rejected too
    let mut ws = connect(&server).await;
    let ack = authenticate(&mut ws, Value::Null).await;
    assert_eq!(ack, None);
}

#[tokio::test]
async fn malformed_credentials_are_rejected_not_downgraded() {
    let server = server().await;
    let mut ws = connect_with_origin(&server, &format!("https://{TRUSTED_ORIGIN}")).await;

    // Carrying both keys is malformed even from a trusted origin
    let ack = authenticate(
        &mut ws,
        json!({ "hash": MACHINE_HASH, "auth": "something" }),
    )
    .await;
    assert_eq!(ack, None);
}

#[tokio::test]
async fn first_message_must_be_authenticate() {
    let server = server().await;
    let mut ws = connect(&server).await;

    send(&mut ws, json!({ "event": "health" })).await;
    assert_eq!(next_json(&mut ws).await, None);
}

#[tokio::test]
async fn tenant_secret_binds_to_its_host() {
    let server = server().await;
    server
        .registry
        .upsert(host_auth("0123456789abcdef", "tenant-s3cret"))
        .await;

    let mut ws = connect(&server).await;
    let ack = authenticate(&mut ws, json!({ "auth": "tenant-s3cret" })).await;
    assert_eq!(ack, Some(json!({ "event": "authenticated" })));

    let mut ws = connect(&server).await;
    let ack = authenticate(&mut ws, json!({ "auth": "unknown" })).await;
    assert_eq!(ack, None);
}

#[tokio::test]
async fn admin_host_command_provisions() {
    let server = server().await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws, json!({ "hash": MACHINE_HASH })).await;

    let auth = host_auth("0123456789abcdef", "tenant-s3cret");
    send(
        &mut ws,
        json!({ "event": "host", "data": serde_json::to_value(&auth).unwrap() }),
    )
    .await;

    // Provisioning runs detached; poll the mock for its effects
    for _ in 0..50 {
        if server
            .runtime
            .container_names()
            .contains(&"hw-0123456789abcdef".to_string())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        server
            .runtime
            .container_names()
            .contains(&"hw-0123456789abcdef".to_string())
    );
    assert!(server.registry.contains("0123456789abcdef").await);
}

#[tokio::test]
async fn tenant_cannot_send_host_command() {
    let server = server().await;
    server
        .registry
        .upsert(host_auth("0123456789abcdef", "tenant-s3cret"))
        .await;

    let mut ws = connect(&server).await;
    authenticate(&mut ws, json!({ "auth": "tenant-s3cret" })).await;

    let auth = host_auth("fedcba9876543210", "other");
    send(
        &mut ws,
        json!({ "event": "host", "data": serde_json::to_value(&auth).unwrap() }),
    )
    .await;

    // Scope violation ends the session and never registers the host
    assert_eq!(next_json(&mut ws).await, None);
    assert!(!server.registry.contains("fedcba9876543210").await);
}

#[tokio::test]
async fn health_subscription_streams_samples() {
    let server = server().await;
    server
        .registry
        .upsert(host_auth("0123456789abcdef", "tenant-s3cret"))
        .await;
    server
        .telemetry
        .start_logging("0123456789abcdef")
        .await
        .unwrap();
    let stats_tx = server.runtime.latest_stats_sender().unwrap();

    let mut ws = connect(&server).await;
    authenticate(&mut ws, json!({ "auth": "tenant-s3cret" })).await;
    send(&mut ws, json!({ "event": "health" })).await;

    stats_tx
        .send(hostwarden::runtime::ContainerStats {
            name: "hw-0123456789abcdef".to_string(),
            cpu_percent: "2.50%".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let frame = next_json(&mut ws).await.expect("healthLog frame");
    assert_eq!(frame["event"], "healthLog");
    assert_eq!(frame["data"]["stats"]["Name"], "hw-0123456789abcdef");
}

#[tokio::test]
async fn console_subscription_streams_lines() {
    let server = server().await;
    server
        .registry
        .upsert(host_auth("0123456789abcdef", "tenant-s3cret"))
        .await;

    let mut ws = connect(&server).await;
    authenticate(&mut ws, json!({ "auth": "tenant-s3cret" })).await;
    send(&mut ws, json!({ "event": "console" })).await;

    // The server opened a log stream for the tenant's container
    let log_tx = {
        let mut sender = None;
        for _ in 0..50 {
            sender = server.runtime.latest_log_sender();
            if sender.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sender.expect("log stream opened")
    };
    log_tx.send("service listening on :25565".to_string()).await.unwrap();

    let frame = next_json(&mut ws).await.expect("console frame");
    assert_eq!(
        frame,
        json!({ "event": "console", "data": "service listening on :25565" })
    );
}
