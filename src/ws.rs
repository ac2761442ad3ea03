//! Per-connection socket actor: handshake/auth, inbound event dispatch, and
//! outbound fan-in filtered by `EventTarget`. Generalizes the teacher's SSE
//! `message_stream` — a `tokio::select!` between a broadcast receiver and a
//! heartbeat tick — to a bidirectional socket with an inbound arm added.

use crate::access::AccessResolver;
use crate::auth::TokenVerifier;
use crate::config::BrokerConfig;
use crate::events::{BrokerEvent, EventBus, EventTarget};
use crate::models::{Cursor, Selection};
use crate::operation_pipeline;
use crate::rate_limit::RateLimiter;
use crate::room_registry::RoomRegistry;
use crate::store::WorkflowStore;
use rocket::futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

pub struct SocketDeps {
    pub registry: Arc<RoomRegistry>,
    pub events: Arc<EventBus>,
    pub store: Arc<dyn WorkflowStore>,
    pub access: Arc<dyn AccessResolver>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<BrokerConfig>,
}

/// Inbound envelope: `{"event": "...", "data": {...}}`, the shape every
/// socket event handler in spec.md §4.8 receives.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// First-frame handshake message: `{"type": "auth", "token": "..."}`. Read
/// before any room state is touched, so a failed handshake never registers a
/// `Connection` — and so the token never rides a query string into access
/// logs the way a `?token=` parameter would.
#[derive(Deserialize)]
struct AuthFrame {
    token: String,
}

pub async fn run_connection(ws: rocket_ws::WebSocket, deps: Arc<SocketDeps>) -> rocket_ws::Channel<'static> {
    ws.channel(move |mut stream| {
        Box::pin(async move {
            let identity = match read_auth_frame(&mut stream).await {
                Some(token) => deps.verifier.verify(&token).await,
                None => Err(crate::errors::BrokerError::AuthenticationFailed(
                    "missing or malformed auth frame".to_string(),
                )),
            };

            let identity = match identity {
                Ok(i) => i,
                Err(e) => {
                    let _ = send_json(
                        &mut stream,
                        "auth-error",
                        &serde_json::json!({"reason": e.to_string()}),
                    )
                    .await;
                    return Ok(());
                }
            };

            let socket_id = uuid::Uuid::new_v4().to_string();
            info!(socket_id = %socket_id, user_id = %identity.user_id, "connection authenticated");

            let mut outbound = deps.events.sender.subscribe();
            let mut heartbeat = interval(Duration::from_secs(15));

            loop {
                tokio::select! {
                    incoming = stream.next() => {
                        let Some(message) = incoming else { break };
                        let message = message?;
                        if message.is_close() {
                            break;
                        }
                        let Ok(text) = message.to_text() else { continue };
                        let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
                            warn!(socket_id = %socket_id, "dropped malformed inbound message");
                            continue;
                        };
                        dispatch(&deps, &socket_id, &identity, envelope).await;
                    }
                    event = outbound.recv() => {
                        match event {
                            Ok(event) => {
                                if !applies_to(&deps, &socket_id, &event.target()) {
                                    continue;
                                }
                                let (name, payload) = event.wire();
                                if send_json(&mut stream, name, &payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(socket_id = %socket_id, missed = n, "socket actor lagged the event bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = heartbeat.tick() => {
                        if send_json(&mut stream, "heartbeat", &serde_json::json!({"time": chrono::Utc::now().to_rfc3339()})).await.is_err() {
                            break;
                        }
                    }
                }
            }

            teardown(&deps, &socket_id);
            Ok(())
        })
    })
}

async fn send_json<S>(stream: &mut S, event: &str, payload: &Value) -> Result<(), rocket_ws::result::Error>
where
    S: rocket::futures::Sink<rocket_ws::Message, Error = rocket_ws::result::Error> + Unpin,
{
    let body = serde_json::json!({"event": event, "data": payload});
    stream.send(rocket_ws::Message::Text(body.to_string())).await
}

async fn read_auth_frame<S>(stream: &mut S) -> Option<String>
where
    S: rocket::futures::Stream<Item = Result<rocket_ws::Message, rocket_ws::result::Error>> + Unpin,
{
    let message = stream.next().await?.ok()?;
    let text = message.to_text().ok()?;
    let frame: AuthFrame = serde_json::from_str(text).ok()?;
    Some(frame.token)
}

fn applies_to(deps: &SocketDeps, socket_id: &str, target: &EventTarget) -> bool {
    match target {
        EventTarget::Socket(sid) => sid == socket_id,
        EventTarget::Workflow(workflow_id) => {
            deps.registry.current_workflow(socket_id).as_deref() == Some(workflow_id.as_str())
        }
        EventTarget::WorkflowExcept(workflow_id, excluded) => {
            excluded != socket_id
                && deps.registry.current_workflow(socket_id).as_deref() == Some(workflow_id.as_str())
        }
        EventTarget::Workspace(workspace_id) => {
            deps.registry
                .current_workspace(socket_id)
                .map(|(w, _)| w)
                .as_deref()
                == Some(workspace_id.as_str())
        }
        EventTarget::Sockets(ids) => ids.iter().any(|id| id == socket_id),
    }
}

async fn dispatch(
    deps: &Arc<SocketDeps>,
    socket_id: &str,
    identity: &crate::models::UserIdentity,
    envelope: Envelope,
) {
    match envelope.event.as_str() {
        "join-workspace" => handle_join_workspace(deps, socket_id, identity, envelope.data).await,
        "leave-workspace" => {
            if let Some(workspace_id) = deps.registry.leave_workspace(socket_id) {
                deps.events.publish(BrokerEvent::LeftWorkspace {
                    socket_id: socket_id.to_string(),
                    workspace_id,
                });
            }
        }
        "join-workflow" => handle_join_workflow(deps, socket_id, identity, envelope.data).await,
        "leave-workflow" => handle_leave_workflow(deps, socket_id),
        "workflow-operation" => handle_workflow_operation(deps, socket_id, envelope.data).await,
        "subblock-update" => {
            operation_pipeline::handle_subblock_update(
                &deps.registry,
                deps.store.as_ref(),
                &deps.events,
                socket_id,
                envelope.data,
            )
            .await
        }
        "variable-update" => {
            operation_pipeline::handle_variable_update(
                &deps.registry,
                deps.store.as_ref(),
                &deps.events,
                socket_id,
                envelope.data,
            )
            .await
        }
        "cursor-update" => handle_cursor_update(deps, socket_id, envelope.data),
        "selection-update" => handle_selection_update(deps, socket_id, envelope.data),
        "request-sync" => {
            operation_pipeline::handle_request_sync(
                &deps.registry,
                deps.store.as_ref(),
                &deps.events,
                socket_id,
            )
            .await
        }
        other => warn!(socket_id = %socket_id, event = other, "unknown inbound event"),
    }
}

async fn handle_join_workspace(
    deps: &Arc<SocketDeps>,
    socket_id: &str,
    identity: &crate::models::UserIdentity,
    data: Value,
) {
    let Some(workspace_id) = data.get("workspaceId").and_then(Value::as_str) else {
        return;
    };

    let role = match deps
        .access
        .resolve_workspace_access(&identity.user_id, &workspace_id.to_string())
        .await
    {
        Ok(Some(role)) => role,
        Ok(None) => {
            deps.events.publish(BrokerEvent::JoinWorkspaceError {
                socket_id: socket_id.to_string(),
                reason: "no access to workspace".to_string(),
            });
            return;
        }
        Err(e) => {
            deps.events.publish(BrokerEvent::JoinWorkspaceError {
                socket_id: socket_id.to_string(),
                reason: e.to_string(),
            });
            return;
        }
    };

    deps.registry
        .join_workspace(workspace_id, socket_id, &identity.user_id, role);
    deps.events.publish(BrokerEvent::JoinedWorkspace {
        socket_id: socket_id.to_string(),
        workspace_id: workspace_id.to_string(),
    });
}

async fn handle_join_workflow(
    deps: &Arc<SocketDeps>,
    socket_id: &str,
    identity: &crate::models::UserIdentity,
    data: Value,
) {
    let (Some(workflow_id), Some(workspace_id)) = (
        data.get("workflowId").and_then(Value::as_str),
        data.get("workspaceId").and_then(Value::as_str),
    ) else {
        return;
    };

    if deps.registry.is_tombstoned(workflow_id) {
        deps.events.publish(BrokerEvent::JoinWorkspaceError {
            socket_id: socket_id.to_string(),
            reason: "workflow was recently deleted".to_string(),
        });
        return;
    }

    let role = match deps
        .access
        .resolve_workflow_access(
            &identity.user_id,
            &workflow_id.to_string(),
            &workspace_id.to_string(),
        )
        .await
    {
        Ok(Some(role)) => role,
        Ok(None) => {
            deps.events.publish(BrokerEvent::JoinWorkspaceError {
                socket_id: socket_id.to_string(),
                reason: "no access to workflow".to_string(),
            });
            return;
        }
        Err(e) => {
            deps.events.publish(BrokerEvent::JoinWorkspaceError {
                socket_id: socket_id.to_string(),
                reason: e.to_string(),
            });
            return;
        }
    };

    if let Err(e) = deps.store.ensure_workflow(workflow_id, workspace_id) {
        warn!(socket_id = %socket_id, error = %e, "failed to seed workflow row");
    }
    let presence = crate::presence::new_presence(identity, socket_id, role);
    let (room, previous) = deps
        .registry
        .join_workflow(workspace_id, workflow_id, presence);

    if let Some(previous_id) = previous {
        if let Some(previous_room) = deps.registry.workflow_room(&previous_id) {
            deps.events.publish(crate::presence::snapshot_event(&previous_room));
        }
    }

    deps.events.publish(crate::presence::snapshot_event(&room));
}

fn handle_leave_workflow(deps: &Arc<SocketDeps>, socket_id: &str) {
    if let Some(workflow_id) = deps.registry.leave_workflow(socket_id) {
        if let Some(room) = deps.registry.workflow_room(&workflow_id) {
            deps.events.publish(crate::presence::snapshot_event(&room));
        }
    }
}

async fn handle_workflow_operation(deps: &Arc<SocketDeps>, socket_id: &str, data: Value) {
    let request: crate::models::OperationRequest = match serde_json::from_value(data) {
        Ok(r) => r,
        Err(e) => {
            deps.events.publish(BrokerEvent::OperationError {
                socket_id: socket_id.to_string(),
                operation_id: String::new(),
                reason: e.to_string(),
            });
            return;
        }
    };

    let rate_key = format!("op:{socket_id}");
    if !deps.rate_limiter.check(
        &rate_key,
        deps.config.operation_rate_max,
        deps.config.operation_rate_window_secs,
    ) {
        deps.events.publish(BrokerEvent::OperationFailed {
            socket_id: socket_id.to_string(),
            operation_id: request.operation_id,
            reason: "rate limited".to_string(),
        });
        return;
    }

    operation_pipeline::handle_workflow_operation(
        &deps.registry,
        deps.store.as_ref(),
        &deps.events,
        socket_id,
        request,
    )
    .await;
}

fn handle_cursor_update(deps: &Arc<SocketDeps>, socket_id: &str, data: Value) {
    let Ok(cursor) = serde_json::from_value::<Cursor>(data) else {
        return;
    };
    let Some(workflow_id) = deps.registry.current_workflow(socket_id) else {
        return;
    };
    let Some(room) = deps.registry.workflow_room(&workflow_id) else {
        return;
    };
    if let Some(event) = crate::presence::apply_cursor_update(&room, socket_id, cursor) {
        deps.events.publish(event);
    }
}

fn handle_selection_update(deps: &Arc<SocketDeps>, socket_id: &str, data: Value) {
    let Ok(selection) = serde_json::from_value::<Selection>(data) else {
        return;
    };
    let Some(workflow_id) = deps.registry.current_workflow(socket_id) else {
        return;
    };
    let Some(room) = deps.registry.workflow_room(&workflow_id) else {
        return;
    };
    if let Some(event) = crate::presence::apply_selection_update(&room, socket_id, selection) {
        deps.events.publish(event);
    }
}

/// Disconnection cancels in-flight operations for this Connection implicitly
/// (no handle is kept past this call); already-committed mutations stand,
/// only the confirmation to this now-gone socket is dropped (spec.md §5).
fn teardown(deps: &Arc<SocketDeps>, socket_id: &str) {
    let workflow_id = deps.registry.current_workflow(socket_id);
    deps.registry.disconnect(socket_id);
    deps.rate_limiter.forget(&format!("op:{socket_id}"));

    if let Some(workflow_id) = workflow_id {
        if let Some(room) = deps.registry.workflow_room(&workflow_id) {
            deps.events.publish(crate::presence::snapshot_event(&room));
        }
    }
    info!(socket_id = %socket_id, "connection closed");
}
