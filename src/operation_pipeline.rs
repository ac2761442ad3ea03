//! Operation Pipeline (spec.md §4.5), the hardest subsystem: authorize,
//! validate, apply, confirm — serialized per workflow room via the room's
//! operation lock, never the membership lock.

use crate::errors::BrokerError;
use crate::events::{BrokerEvent, EventBus};
use crate::models::{OperationOutcome, OperationRequest, Role, TargetKind, WorkflowId};
use crate::room_registry::RoomRegistry;
use crate::store::WorkflowStore;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

/// Publishes the correctly-shaped per-operation failure event for a given
/// `BrokerError`, using `BrokerError::socket_event` as the single source of
/// truth for which wire event a failure kind renders as — instead of each
/// call site hardcoding its own guess at the mapping.
fn publish_operation_error(
    events: &EventBus,
    socket_id: &str,
    operation_id: String,
    err: BrokerError,
) {
    match err.socket_event() {
        "operation-forbidden" => events.publish(BrokerEvent::OperationForbidden {
            socket_id: socket_id.to_string(),
            operation_id,
        }),
        "operation-error" => events.publish(BrokerEvent::OperationError {
            socket_id: socket_id.to_string(),
            operation_id,
            reason: err.to_string(),
        }),
        _ => events.publish(BrokerEvent::OperationFailed {
            socket_id: socket_id.to_string(),
            operation_id,
            reason: err.to_string(),
        }),
    }
}

fn require_field<'a>(payload: &'a Value, field: &str) -> Result<&'a Value, BrokerError> {
    payload
        .get(field)
        .ok_or_else(|| BrokerError::OperationInvalid(format!("missing field '{field}'")))
}

/// Structural validation (step 2): pure, synchronous, table-driven per
/// `(target, operation)` pair. No I/O — never needs the operation lock.
fn validate(target: TargetKind, operation: &str, payload: &Value) -> Result<(), BrokerError> {
    match target {
        TargetKind::Block => match operation {
            "create" | "update" => {
                require_field(payload, "id")?;
                Ok(())
            }
            "delete" => {
                require_field(payload, "id")?;
                Ok(())
            }
            "position" => {
                require_field(payload, "blockId")?;
                let x = require_field(payload, "x")?;
                let y = require_field(payload, "y")?;
                if !x.is_number() || !y.is_number() {
                    return Err(BrokerError::OperationInvalid(
                        "position update requires numeric x, y".to_string(),
                    ));
                }
                Ok(())
            }
            other => Err(BrokerError::OperationInvalid(format!(
                "unknown block operation '{other}'"
            ))),
        },
        TargetKind::Edge => match operation {
            "create" | "update" => {
                require_field(payload, "id")?;
                require_field(payload, "sourceBlockId")?;
                require_field(payload, "targetBlockId")?;
                Ok(())
            }
            "delete" => {
                require_field(payload, "id")?;
                Ok(())
            }
            other => Err(BrokerError::OperationInvalid(format!(
                "unknown edge operation '{other}'"
            ))),
        },
        TargetKind::Subflow => match operation {
            "create" | "update" | "delete" => {
                require_field(payload, "id")?;
                require_field(payload, "kind")?;
                Ok(())
            }
            other => Err(BrokerError::OperationInvalid(format!(
                "unknown subflow operation '{other}'"
            ))),
        },
        TargetKind::Subblock => {
            require_field(payload, "blockId")?;
            require_field(payload, "subblockId")?;
            require_field(payload, "value")?;
            Ok(())
        }
        TargetKind::Variable => {
            require_field(payload, "variableId")?;
            require_field(payload, "value")?;
            Ok(())
        }
    }
}

/// Handles an inbound `workflow-operation` message end to end. Never
/// returns `Err` to the caller — every failure is reported to the
/// originating socket as an event and swallowed here, matching §7's
/// "per-operation errors never close the Connection".
pub async fn handle_workflow_operation(
    registry: &RoomRegistry,
    store: &dyn WorkflowStore,
    events: &EventBus,
    socket_id: &str,
    request: OperationRequest,
) {
    let Some(workflow_id) = registry.current_workflow(socket_id) else {
        events.publish(BrokerEvent::OperationError {
            socket_id: socket_id.to_string(),
            operation_id: request.operation_id,
            reason: "not joined to a workflow".to_string(),
        });
        return;
    };

    let Some(room) = registry.workflow_room(&workflow_id) else {
        events.publish(BrokerEvent::OperationError {
            socket_id: socket_id.to_string(),
            operation_id: request.operation_id,
            reason: "workflow room no longer exists".to_string(),
        });
        return;
    };

    // Authorize (step 1).
    let Some(presence) = room.get_presence(socket_id) else {
        events.publish(BrokerEvent::OperationError {
            socket_id: socket_id.to_string(),
            operation_id: request.operation_id,
            reason: "no presence in room".to_string(),
        });
        return;
    };
    if !presence.role.can_mutate() {
        events.publish(BrokerEvent::OperationForbidden {
            socket_id: socket_id.to_string(),
            operation_id: request.operation_id,
        });
        return;
    }

    // Validate (step 2), no I/O.
    if let Err(e) = validate(request.target, &request.operation, &request.payload) {
        publish_operation_error(events, socket_id, request.operation_id.clone(), e);
        return;
    }

    // Position updates with commit=false broadcast but are never persisted.
    if request.target == TargetKind::Block && request.operation == "position" {
        let commit = request
            .payload
            .get("commit")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !commit {
            broadcast_uncommitted_position(events, &workflow_id, socket_id, &request);
            events.publish(BrokerEvent::OperationConfirmed {
                socket_id: socket_id.to_string(),
                operation_id: request.operation_id,
                server_timestamp: Utc::now().timestamp_millis(),
            });
            return;
        }
    }

    // Apply + confirm (steps 3-5), serialized per room.
    let _guard = room.operation_lock.lock().await;

    let apply_result = match (request.target, request.operation.as_str()) {
        (TargetKind::Block, "position") => store.apply_block_position(&workflow_id, &request.payload),
        (TargetKind::Block, op) => store.apply_block_op(&workflow_id, op, &request.payload),
        (TargetKind::Edge, op) => store.apply_edge_op(&workflow_id, op, &request.payload),
        (TargetKind::Subflow, op) => store.apply_subflow_op(&workflow_id, op, &request.payload),
        (TargetKind::Subblock, _) => store.apply_subblock_value(&workflow_id, &request.payload),
        (TargetKind::Variable, _) => store.apply_variable_value(&workflow_id, &request.payload),
    };

    if let Err(e) = apply_result {
        warn!(workflow_id = %workflow_id, operation_id = %request.operation_id, error = %e, "operation failed to apply");
        publish_operation_error(events, socket_id, request.operation_id.clone(), e);
        return;
    }

    let server_timestamp = Utc::now().timestamp_millis();
    room.bump_last_modified(server_timestamp);

    events.publish(BrokerEvent::OperationConfirmed {
        socket_id: socket_id.to_string(),
        operation_id: request.operation_id.clone(),
        server_timestamp,
    });

    let mut payload = request.payload.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("workflowId".to_string(), Value::String(workflow_id.clone()));
    }
    events.publish(BrokerEvent::OperationBroadcast(OperationOutcome {
        operation_id: request.operation_id,
        target: request.target,
        operation: request.operation,
        payload,
        server_timestamp,
        originating_socket: socket_id.to_string(),
    }));
}

fn broadcast_uncommitted_position(
    events: &EventBus,
    workflow_id: &WorkflowId,
    socket_id: &str,
    request: &OperationRequest,
) {
    let mut payload = request.payload.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("workflowId".to_string(), Value::String(workflow_id.clone()));
    }
    events.publish(BrokerEvent::OperationBroadcast(OperationOutcome {
        operation_id: request.operation_id.clone(),
        target: request.target,
        operation: request.operation.clone(),
        payload,
        server_timestamp: Utc::now().timestamp_millis(),
        originating_socket: socket_id.to_string(),
    }));
}

/// `request-sync`: bypasses structural validation and store mutation,
/// fetches authoritative state and replies to the requester only.
pub async fn handle_request_sync(
    registry: &RoomRegistry,
    store: &dyn WorkflowStore,
    events: &EventBus,
    socket_id: &str,
) {
    let Some(workflow_id) = registry.current_workflow(socket_id) else {
        return;
    };
    match store.get_state(&workflow_id) {
        Ok(state) => events.publish(BrokerEvent::WorkflowState {
            socket_id: socket_id.to_string(),
            state,
        }),
        Err(e) => publish_operation_error(events, socket_id, "request-sync".to_string(), e),
    }
}

/// Role check shared with `subblock-update`/`variable-update`, which are
/// narrower mutation paths than a full `workflow-operation` but still gated
/// the same way (spec.md §4.5: "narrower forms of (3)").
fn check_mutating_role(role: Role) -> Result<(), BrokerError> {
    if role.can_mutate() {
        Ok(())
    } else {
        Err(BrokerError::OperationForbidden(
            "role does not permit mutation".to_string(),
        ))
    }
}

pub async fn handle_subblock_update(
    registry: &RoomRegistry,
    store: &dyn WorkflowStore,
    events: &EventBus,
    socket_id: &str,
    payload: Value,
) {
    apply_narrow_mutation(registry, store, events, socket_id, TargetKind::Subblock, payload).await
}

pub async fn handle_variable_update(
    registry: &RoomRegistry,
    store: &dyn WorkflowStore,
    events: &EventBus,
    socket_id: &str,
    payload: Value,
) {
    apply_narrow_mutation(registry, store, events, socket_id, TargetKind::Variable, payload).await
}

async fn apply_narrow_mutation(
    registry: &RoomRegistry,
    store: &dyn WorkflowStore,
    events: &EventBus,
    socket_id: &str,
    target: TargetKind,
    payload: Value,
) {
    let operation_id = payload
        .get("operationId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let Some(workflow_id) = registry.current_workflow(socket_id) else {
        events.publish(BrokerEvent::OperationError {
            socket_id: socket_id.to_string(),
            operation_id,
            reason: "not joined to a workflow".to_string(),
        });
        return;
    };
    let Some(room) = registry.workflow_room(&workflow_id) else {
        return;
    };
    let Some(presence) = room.get_presence(socket_id) else {
        return;
    };

    if let Err(e) = check_mutating_role(presence.role) {
        warn!(%e, "mutation rejected");
        publish_operation_error(events, socket_id, operation_id, e);
        return;
    }

    if let Err(e) = validate(target, "update", &payload) {
        publish_operation_error(events, socket_id, operation_id, e);
        return;
    }

    let _guard = room.operation_lock.lock().await;

    let result = match target {
        TargetKind::Subblock => store.apply_subblock_value(&workflow_id, &payload),
        TargetKind::Variable => store.apply_variable_value(&workflow_id, &payload),
        _ => unreachable!("apply_narrow_mutation only called for subblock/variable targets"),
    };

    if let Err(e) = result {
        publish_operation_error(events, socket_id, operation_id, e);
        return;
    }

    let server_timestamp = Utc::now().timestamp_millis();
    room.bump_last_modified(server_timestamp);
    events.publish(BrokerEvent::OperationConfirmed {
        socket_id: socket_id.to_string(),
        operation_id: operation_id.clone(),
        server_timestamp,
    });

    let mut broadcast_payload = payload;
    if let Some(obj) = broadcast_payload.as_object_mut() {
        obj.insert("workflowId".to_string(), Value::String(workflow_id.clone()));
    }
    events.publish(BrokerEvent::OperationBroadcast(OperationOutcome {
        operation_id,
        target,
        operation: "update".to_string(),
        payload: broadcast_payload,
        server_timestamp,
        originating_socket: socket_id.to_string(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_position_requires_numeric_x_y() {
        let payload = serde_json::json!({"blockId": "b1", "x": "nope", "y": 2});
        let err = validate(TargetKind::Block, "position", &payload).unwrap_err();
        assert!(matches!(err, BrokerError::OperationInvalid(_)));
    }

    #[test]
    fn edge_create_requires_endpoints() {
        let payload = serde_json::json!({"id": "e1"});
        let err = validate(TargetKind::Edge, "create", &payload).unwrap_err();
        assert!(matches!(err, BrokerError::OperationInvalid(_)));
    }

    #[test]
    fn subblock_update_requires_block_and_value() {
        let payload = serde_json::json!({"blockId": "b1"});
        let err = validate(TargetKind::Subblock, "update", &payload).unwrap_err();
        assert!(matches!(err, BrokerError::OperationInvalid(_)));
    }

    #[test]
    fn publish_operation_error_follows_the_broker_error_socket_event_mapping() {
        let events = EventBus::new();
        let mut rx = events.sender.subscribe();

        publish_operation_error(
            &events,
            "s1",
            "op1".to_string(),
            BrokerError::OperationInvalid("bad field".to_string()),
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            BrokerEvent::OperationError { .. }
        ));

        publish_operation_error(
            &events,
            "s1",
            "op2".to_string(),
            BrokerError::OperationForbidden("nope".to_string()),
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            BrokerEvent::OperationForbidden { .. }
        ));

        publish_operation_error(
            &events,
            "s1",
            "op3".to_string(),
            BrokerError::OperationConflict("conflict".to_string()),
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            BrokerEvent::OperationFailed { .. }
        ));
    }
}
