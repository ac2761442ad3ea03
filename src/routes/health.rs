use crate::room_registry::RoomRegistry;
use rocket::serde::json::Json;
use rocket::{get, State};
use std::sync::Arc;

#[get("/health")]
pub fn health(registry: &State<Arc<RoomRegistry>>) -> Json<serde_json::Value> {
    let (workflow_rooms, workspace_rooms, connections) = registry.counts();
    Json(serde_json::json!({
        "status": "ok",
        "service": "workflow-broker",
        "version": env!("CARGO_PKG_VERSION"),
        "workflowRooms": workflow_rooms,
        "workspaceRooms": workspace_rooms,
        "connections": connections,
    }))
}
