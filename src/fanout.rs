//! Workspace Fanout (spec.md §4.6): maps `(resourceType, operation)` tuples
//! from the Ingress Adapter onto an outbound event name and payload. A pure,
//! table-driven function — no I/O, no locking.

use crate::models::{ResourceOperation, ResourceType};
use serde_json::Value;

/// `None` means the Ingress Adapter handed us a combination the table
/// doesn't list — an `IngressMalformed` at the HTTP boundary, not a silent
/// drop (SPEC_FULL.md Workspace Fanout notes).
pub fn dispatch(
    resource_type: ResourceType,
    operation: ResourceOperation,
    data: &Value,
) -> Option<(&'static str, Value)> {
    use ResourceOperation::*;
    use ResourceType::*;

    match (resource_type, operation) {
        // Env never leaks values; only the changed key names travel.
        (Env, Update) | (Env, Delete) => {
            let keys = data.get("keys").cloned().unwrap_or(Value::Array(vec![]));
            Some(("workspace-env-updated", serde_json::json!({ "keys": keys })))
        }
        (Env, Create) => None,

        (Tools, Create) => Some(("workspace-tool-created", data.clone())),
        (Tools, Update) => Some(("workspace-tool-updated", data.clone())),
        (Tools, Delete) => Some(("workspace-tool-deleted", data.clone())),

        (Folders, Create) => Some(("workspace-folder-created", data.clone())),
        (Folders, Update) => Some(("workspace-folder-updated", data.clone())),
        (Folders, Delete) => Some(("workspace-folder-deleted", data.clone())),

        (Mcp, Create) => Some(("workspace-mcp-created", data.clone())),
        (Mcp, Update) => Some(("workspace-mcp-updated", data.clone())),
        (Mcp, Delete) => Some(("workspace-mcp-deleted", data.clone())),

        (Workflows, Create) => Some(("workspace-workflow-created", data.clone())),
        (Workflows, Update) => Some(("workspace-workflow-updated", data.clone())),
        (Workflows, Delete) => Some(("workspace-workflow-deleted", data.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_update_and_delete_both_collapse_to_updated() {
        let data = serde_json::json!({"keys": ["API_KEY"]});
        let (name, _) = dispatch(ResourceType::Env, ResourceOperation::Update, &data).unwrap();
        assert_eq!(name, "workspace-env-updated");
        let (name, _) = dispatch(ResourceType::Env, ResourceOperation::Delete, &data).unwrap();
        assert_eq!(name, "workspace-env-updated");
    }

    #[test]
    fn env_payload_never_carries_values() {
        let data = serde_json::json!({"keys": ["API_KEY"], "values": {"API_KEY": "secret"}});
        let (_, payload) = dispatch(ResourceType::Env, ResourceOperation::Update, &data).unwrap();
        assert!(payload.get("values").is_none());
    }

    #[test]
    fn mcp_events_carry_distinct_per_operation_names() {
        let data = serde_json::json!({});
        let (created, _) = dispatch(ResourceType::Mcp, ResourceOperation::Create, &data).unwrap();
        let (updated, _) = dispatch(ResourceType::Mcp, ResourceOperation::Update, &data).unwrap();
        let (deleted, _) = dispatch(ResourceType::Mcp, ResourceOperation::Delete, &data).unwrap();
        assert_eq!(created, "workspace-mcp-created");
        assert_eq!(updated, "workspace-mcp-updated");
        assert_eq!(deleted, "workspace-mcp-deleted");
    }

    #[test]
    fn env_create_is_not_in_the_table() {
        let data = serde_json::json!({});
        assert!(dispatch(ResourceType::Env, ResourceOperation::Create, &data).is_none());
    }
}
