//! Wire-level delivery tests: these drive a real WebSocket handshake against
//! a broker bound to an OS-assigned loopback port, the way `common::test_client`
//! drives real HTTP against the same Rocket app. Rocket's local test client
//! never performs the upgrade `rocket_ws` needs, so `applies_to` (ws.rs) can
//! only be exercised this way — by actually connecting sockets and reading
//! the frames they receive.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use workflow_broker::access::SqlitePermissionStore;
use workflow_broker::auth::StaticTokenVerifier;
use workflow_broker::config::BrokerConfig;
use workflow_broker::models::Role;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Boots a real broker on an OS-assigned loopback port, granting `u1` and
/// `u2` edit access to workspace `ws1` so both can join workflows under it.
async fn spawn_test_broker() -> (u16, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("broker.db");

    {
        let permissions = SqlitePermissionStore::new(&db_path.to_string_lossy())
            .expect("failed to open permission store");
        permissions.grant("u1", "ws1", Role::Edit).unwrap();
        permissions.grant("u2", "ws1", Role::Edit).unwrap();
    }

    let mut config = BrokerConfig::default();
    config.database_path = db_path.to_string_lossy().to_string();

    let rocket = workflow_broker::rocket_with_config(config).configure(rocket::Config {
        port: 0,
        address: std::net::Ipv4Addr::LOCALHOST.into(),
        log_level: rocket::config::LogLevel::Off,
        ..rocket::Config::default()
    });

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let rocket = rocket.attach(rocket::fairing::AdHoc::on_liftoff(
        "test port capture",
        move |rocket| {
            let port = rocket.endpoints().next().and_then(|e| e.port());
            Box::pin(async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(port.expect("broker listener bound to a concrete port"));
                }
            })
        },
    ));

    tokio::spawn(async move {
        let _ = rocket.launch().await;
    });

    let port = rx.await.expect("broker failed to lift off");
    (port, dir)
}

/// Opens a socket, completes the auth handshake, and joins `workflow_id`
/// under `workspace_id`, waiting for the resulting presence snapshot so the
/// caller knows the join has actually landed in the room registry.
async fn connect_and_join(
    port: u16,
    user_id: &str,
    workflow_id: &str,
    workspace_id: &str,
) -> WsStream {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/socket"))
        .await
        .expect("failed to open websocket");

    let token = StaticTokenVerifier::sign("dev-secret", user_id, "Test User");
    ws.send(Message::Text(
        serde_json::json!({ "token": token }).to_string(),
    ))
    .await
    .expect("failed to send auth frame");

    ws.send(Message::Text(
        serde_json::json!({
            "event": "join-workspace",
            "data": { "workspaceId": workspace_id },
        })
        .to_string(),
    ))
    .await
    .expect("failed to send join-workspace");

    recv_event(&mut ws, "joined-workspace")
        .await
        .expect("join-workspace should be acknowledged");

    ws.send(Message::Text(
        serde_json::json!({
            "event": "join-workflow",
            "data": { "workflowId": workflow_id, "workspaceId": workspace_id },
        })
        .to_string(),
    ))
    .await
    .expect("failed to send join-workflow");

    recv_event(&mut ws, "presence-update")
        .await
        .expect("join-workflow should broadcast a presence snapshot");

    ws
}

/// Reads frames until one with `event == expected` arrives, or gives up.
async fn recv_event(ws: &mut WsStream, expected: &str) -> Option<serde_json::Value> {
    for _ in 0..20 {
        let next = match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(msg))) => msg,
            _ => return None,
        };
        let Message::Text(text) = next else { continue };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        if value.get("event").and_then(|e| e.as_str()) == Some(expected) {
            return Some(value);
        }
    }
    None
}

/// Drains frames for `window` and fails the test if `unexpected` ever shows up.
async fn assert_event_absent(ws: &mut WsStream, unexpected: &str, window: Duration) {
    let sleep = tokio::time::sleep(window);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return,
            msg = ws.next() => {
                let Some(Ok(Message::Text(text))) = msg else { continue };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
                if value.get("event").and_then(|e| e.as_str()) == Some(unexpected) {
                    panic!("{unexpected} reached a socket that was never in the deleted workflow's room");
                }
            }
        }
    }
}

#[tokio::test]
async fn workflow_deleted_reaches_only_the_sockets_that_were_in_the_room() {
    let (port, _dir) = spawn_test_broker().await;

    let mut member = connect_and_join(port, "u1", "wf1", "ws1").await;
    let mut bystander = connect_and_join(port, "u2", "wf2", "ws1").await;

    let http = reqwest::Client::new();
    let res = http
        .post(format!("http://127.0.0.1:{port}/api/workflow-deleted"))
        .json(&serde_json::json!({ "workflow_id": "wf1" }))
        .send()
        .await
        .expect("ingress call failed");
    assert!(res.status().is_success());

    let deleted = recv_event(&mut member, "workflow-deleted")
        .await
        .expect("the socket in the deleted workflow's room should see workflow-deleted");
    assert_eq!(deleted["data"]["workflowId"], "wf1");

    assert_event_absent(&mut bystander, "workflow-deleted", Duration::from_millis(500)).await;
}

#[tokio::test]
async fn permission_revoked_reaches_only_the_affected_socket() {
    let (port, _dir) = spawn_test_broker().await;

    let mut revoked_socket = connect_and_join(port, "u1", "wf1", "ws1").await;
    let mut other_socket = connect_and_join(port, "u2", "wf1", "ws1").await;

    let http = reqwest::Client::new();
    let res = http
        .post(format!("http://127.0.0.1:{port}/api/permission-changed"))
        .json(&serde_json::json!({
            "user_id": "u1",
            "workspace_id": "ws1",
            "is_removed": true,
        }))
        .send()
        .await
        .expect("ingress call failed");
    assert!(res.status().is_success());

    let revoked = recv_event(&mut revoked_socket, "permission-revoked").await;
    assert!(
        revoked.is_some(),
        "the revoked user's socket should receive permission-revoked"
    );

    assert_event_absent(
        &mut other_socket,
        "permission-revoked",
        Duration::from_millis(500),
    )
    .await;
}
