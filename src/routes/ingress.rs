//! Ingress Adapter (spec.md §4.8): HTTP POST endpoints the application tier
//! calls into. Each parses its body, dispatches to the corresponding
//! component, and returns `{success: true}` or an error object — malformed
//! JSON always renders as a 500 via `BrokerError::IngressMalformed`, per the
//! error taxonomy, never a 400.

use crate::errors::BrokerError;
use crate::events::{BrokerEvent, EventBus};
use crate::eviction;
use crate::fanout;
use crate::models::{
    CopilotWorkflowEdit, PermissionChanged, WorkflowDeleted, WorkflowReverted, WorkflowUpdated,
    WorkspaceResourceChanged,
};
use crate::room_registry::RoomRegistry;
use crate::routes::IngressTrust;
use rocket::http::Status;
use rocket::serde::json::{Error as JsonError, Json};
use rocket::{post, State};
use std::sync::Arc;

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({"success": true}))
}

fn malformed(err: JsonError<'_>) -> (Status, Json<serde_json::Value>) {
    BrokerError::IngressMalformed(err.to_string()).to_json()
}

#[post("/api/permission-changed", data = "<body>")]
pub fn permission_changed(
    _trust: IngressTrust,
    body: Result<Json<PermissionChanged>, JsonError<'_>>,
    registry: &State<Arc<RoomRegistry>>,
    events: &State<Arc<EventBus>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let change = body.map_err(malformed)?.into_inner();
    eviction::handle_permission_changed(registry, events, change);
    Ok(ok())
}

#[post("/api/workflow-deleted", data = "<body>")]
pub fn workflow_deleted(
    _trust: IngressTrust,
    body: Result<Json<WorkflowDeleted>, JsonError<'_>>,
    registry: &State<Arc<RoomRegistry>>,
    events: &State<Arc<EventBus>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let notice = body.map_err(malformed)?.into_inner();
    eviction::handle_workflow_deleted(registry, events, notice);
    Ok(ok())
}

#[post("/api/workflow-updated", data = "<body>")]
pub fn workflow_updated(
    _trust: IngressTrust,
    body: Result<Json<WorkflowUpdated>, JsonError<'_>>,
    events: &State<Arc<EventBus>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let notice = body.map_err(malformed)?.into_inner();
    events.publish(BrokerEvent::WorkflowUpdated {
        workflow_id: notice.workflow_id,
        data: notice.data,
    });
    Ok(ok())
}

#[post("/api/workflow-reverted", data = "<body>")]
pub fn workflow_reverted(
    _trust: IngressTrust,
    body: Result<Json<WorkflowReverted>, JsonError<'_>>,
    events: &State<Arc<EventBus>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let notice = body.map_err(malformed)?.into_inner();
    events.publish(BrokerEvent::WorkflowReverted {
        workflow_id: notice.workflow_id,
    });
    Ok(ok())
}

#[post("/api/copilot-workflow-edit", data = "<body>")]
pub fn copilot_workflow_edit(
    _trust: IngressTrust,
    body: Result<Json<CopilotWorkflowEdit>, JsonError<'_>>,
    events: &State<Arc<EventBus>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let notice = body.map_err(malformed)?.into_inner();
    events.publish(BrokerEvent::CopilotWorkflowEdit {
        workflow_id: notice.workflow_id,
    });
    Ok(ok())
}

#[post("/api/workspace-resource-changed", data = "<body>")]
pub fn workspace_resource_changed(
    _trust: IngressTrust,
    body: Result<Json<WorkspaceResourceChanged>, JsonError<'_>>,
    events: &State<Arc<EventBus>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let change = body.map_err(malformed)?.into_inner();
    match fanout::dispatch(change.resource_type, change.operation, &change.data) {
        Some((event_name, payload)) => {
            events.publish(BrokerEvent::WorkspaceResource {
                workspace_id: change.workspace_id,
                event_name,
                operation: change.operation,
                payload,
            });
            Ok(ok())
        }
        None => Err(BrokerError::IngressMalformed(format!(
            "no fanout mapping for {:?}/{:?}",
            change.resource_type, change.operation
        ))
        .to_json()),
    }
}
