//! The broker's event bus: a single broadcast channel fanning out to every
//! connection's socket actor, which filters by [`EventTarget`] the way the
//! teacher's SSE streams filter a shared broadcast channel by room id.

use crate::models::{
    OperationOutcome, Presence, PresenceSnapshot, SocketId, WorkflowId, WorkflowState,
    WorkspaceId,
};
use tokio::sync::broadcast;

/// Who an event is destined for. The per-connection socket actor (`ws.rs`)
/// decides whether a given event applies to it by matching this against its
/// own socket id and current room memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    /// Every connection in a workflow room.
    Workflow(WorkflowId),
    /// Every connection in a workflow room except the named socket —
    /// used for the `workflow-operation` broadcast, which excludes the
    /// originator (spec.md §4.5 step 4).
    WorkflowExcept(WorkflowId, SocketId),
    /// Every connection in a workspace room.
    Workspace(WorkspaceId),
    /// Exactly one connection — confirmations, rejections, and sync replies.
    Socket(SocketId),
    /// A fixed set of connections captured at publish time, rather than
    /// whoever a live room lookup says is a member right now. Used for
    /// eviction notices, where the membership that should receive the
    /// notice is the membership the eviction just tore down.
    Sockets(Vec<SocketId>),
}

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    PresenceUpdate(PresenceSnapshot),
    CursorUpdate {
        workflow_id: WorkflowId,
        presence: Presence,
    },
    SelectionUpdate {
        workflow_id: WorkflowId,
        presence: Presence,
    },
    OperationConfirmed {
        socket_id: SocketId,
        operation_id: String,
        server_timestamp: i64,
    },
    OperationBroadcast(OperationOutcome),
    OperationFailed {
        socket_id: SocketId,
        operation_id: String,
        reason: String,
    },
    OperationForbidden {
        socket_id: SocketId,
        operation_id: String,
    },
    OperationError {
        socket_id: SocketId,
        operation_id: String,
        reason: String,
    },
    WorkflowState {
        socket_id: SocketId,
        state: WorkflowState,
    },
    WorkflowDeleted {
        workflow_id: WorkflowId,
        /// Sockets evicted from the room by the same call that produced
        /// this event, captured before publish so delivery doesn't depend
        /// on a live membership re-check racing the eviction.
        evicted: Vec<SocketId>,
    },
    WorkflowReverted {
        workflow_id: WorkflowId,
    },
    WorkflowUpdated {
        workflow_id: WorkflowId,
        data: serde_json::Value,
    },
    CopilotWorkflowEdit {
        workflow_id: WorkflowId,
    },
    PermissionChanged {
        socket_id: SocketId,
        old_role: Option<crate::models::Role>,
        new_role: crate::models::Role,
    },
    PermissionRevoked {
        socket_id: SocketId,
        workspace_id: WorkspaceId,
    },
    WorkspaceResource {
        workspace_id: WorkspaceId,
        event_name: &'static str,
        operation: crate::models::ResourceOperation,
        payload: serde_json::Value,
    },
    JoinedWorkspace {
        socket_id: SocketId,
        workspace_id: WorkspaceId,
    },
    LeftWorkspace {
        socket_id: SocketId,
        workspace_id: WorkspaceId,
    },
    JoinWorkspaceError {
        socket_id: SocketId,
        reason: String,
    },
}

impl BrokerEvent {
    pub fn target(&self) -> EventTarget {
        use BrokerEvent::*;
        match self {
            PresenceUpdate(snap) => EventTarget::Workflow(snap.workflow_id.clone()),
            CursorUpdate { workflow_id, presence } => {
                EventTarget::WorkflowExcept(workflow_id.clone(), presence.socket_id.clone())
            }
            SelectionUpdate { workflow_id, presence } => {
                EventTarget::WorkflowExcept(workflow_id.clone(), presence.socket_id.clone())
            }
            OperationConfirmed { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            OperationBroadcast(outcome) => EventTarget::WorkflowExcept(
                outcome_workflow_id(outcome),
                outcome.originating_socket.clone(),
            ),
            OperationFailed { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            OperationForbidden { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            OperationError { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            WorkflowState { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            WorkflowDeleted { evicted, .. } => EventTarget::Sockets(evicted.clone()),
            WorkflowReverted { workflow_id } => EventTarget::Workflow(workflow_id.clone()),
            WorkflowUpdated { workflow_id, .. } => EventTarget::Workflow(workflow_id.clone()),
            CopilotWorkflowEdit { workflow_id } => EventTarget::Workflow(workflow_id.clone()),
            PermissionChanged { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            PermissionRevoked { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            WorkspaceResource { workspace_id, .. } => EventTarget::Workspace(workspace_id.clone()),
            JoinedWorkspace { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            LeftWorkspace { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
            JoinWorkspaceError { socket_id, .. } => EventTarget::Socket(socket_id.clone()),
        }
    }

    /// `(event name, JSON payload)` as it appears on the wire.
    pub fn wire(&self) -> (&'static str, serde_json::Value) {
        use BrokerEvent::*;
        match self {
            PresenceUpdate(snap) => (
                "presence-update",
                serde_json::json!({"workflowId": snap.workflow_id, "presences": snap.presences}),
            ),
            CursorUpdate { presence, .. } => (
                "cursor-update",
                serde_json::json!({"socketId": presence.socket_id, "cursor": presence.cursor}),
            ),
            SelectionUpdate { presence, .. } => (
                "selection-update",
                serde_json::json!({"socketId": presence.socket_id, "selection": presence.selection}),
            ),
            OperationConfirmed {
                operation_id,
                server_timestamp,
                ..
            } => (
                "operation-confirmed",
                serde_json::json!({"operationId": operation_id, "serverTimestamp": server_timestamp}),
            ),
            OperationBroadcast(outcome) => (
                operation_broadcast_event_name(outcome.target),
                serde_json::to_value(outcome).unwrap(),
            ),
            OperationFailed {
                operation_id, reason, ..
            } => (
                "operation-failed",
                serde_json::json!({"operationId": operation_id, "reason": reason}),
            ),
            OperationForbidden { operation_id, .. } => (
                "operation-forbidden",
                serde_json::json!({"operationId": operation_id}),
            ),
            OperationError {
                operation_id, reason, ..
            } => (
                "operation-error",
                serde_json::json!({"operationId": operation_id, "reason": reason}),
            ),
            WorkflowState { state, .. } => ("workflow-state", serde_json::to_value(state).unwrap()),
            WorkflowDeleted { workflow_id, .. } => (
                "workflow-deleted",
                serde_json::json!({"workflowId": workflow_id}),
            ),
            WorkflowReverted { workflow_id } => (
                "workflow-reverted",
                serde_json::json!({"workflowId": workflow_id}),
            ),
            WorkflowUpdated { workflow_id, data } => (
                "workflow-updated",
                serde_json::json!({"workflowId": workflow_id, "data": data}),
            ),
            CopilotWorkflowEdit { workflow_id } => (
                "copilot-workflow-edit",
                serde_json::json!({"workflowId": workflow_id}),
            ),
            PermissionChanged {
                old_role, new_role, ..
            } => (
                "permission-changed",
                serde_json::json!({"oldRole": old_role, "newRole": new_role}),
            ),
            PermissionRevoked { workspace_id, .. } => (
                "permission-revoked",
                serde_json::json!({"workspaceId": workspace_id}),
            ),
            WorkspaceResource {
                event_name,
                operation,
                payload,
                ..
            } => {
                let mut envelope = payload.clone();
                if let Some(obj) = envelope.as_object_mut() {
                    obj.insert(
                        "operation".to_string(),
                        serde_json::to_value(operation).unwrap(),
                    );
                }
                (event_name, envelope)
            }
            JoinedWorkspace { workspace_id, .. } => (
                "joined-workspace",
                serde_json::json!({"workspaceId": workspace_id}),
            ),
            LeftWorkspace { workspace_id, .. } => (
                "left-workspace",
                serde_json::json!({"workspaceId": workspace_id}),
            ),
            JoinWorkspaceError { reason, .. } => (
                "join-workspace-error",
                serde_json::json!({"reason": reason}),
            ),
        }
    }
}

/// `subblock-update` and `variable-update` are narrower mutation paths than
/// `workflow-operation` (spec.md §6) and get their own wire event names even
/// though they share the same `OperationOutcome` payload shape.
fn operation_broadcast_event_name(target: crate::models::TargetKind) -> &'static str {
    use crate::models::TargetKind;
    match target {
        TargetKind::Subblock => "subblock-update",
        TargetKind::Variable => "variable-update",
        TargetKind::Block | TargetKind::Edge | TargetKind::Subflow => "workflow-operation",
    }
}

fn outcome_workflow_id(outcome: &OperationOutcome) -> WorkflowId {
    // The operation pipeline stamps the workflow id into the payload envelope
    // when it builds the outcome; see operation_pipeline::confirm.
    outcome
        .payload
        .get("workflowId")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

pub struct EventBus {
    pub sender: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: BrokerEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }
}
