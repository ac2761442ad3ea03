//! Eviction Controller (spec.md §4.7): permission downgrade/revoke and
//! workflow deletion, both delivered through the Ingress Adapter. Runs only
//! under each affected room's membership lock, never the operation lock —
//! the controller holds no back-pointers to Connections, only socket ids.

use crate::events::{BrokerEvent, EventBus};
use crate::models::{PermissionChanged, Role, WorkflowDeleted};
use crate::room_registry::RoomRegistry;
use tracing::info;

/// Handles `/api/permission-changed` (spec.md §4.7 trigger 1).
pub fn handle_permission_changed(registry: &RoomRegistry, events: &EventBus, change: PermissionChanged) {
    let Some(workspace_room) = registry.workspace_room(&change.workspace_id) else {
        return;
    };

    let affected_sockets = workspace_room.members_for_user(&change.user_id);
    if affected_sockets.is_empty() {
        return;
    }

    if change.is_removed {
        for socket_id in &affected_sockets {
            events.publish(BrokerEvent::PermissionRevoked {
                socket_id: socket_id.clone(),
                workspace_id: change.workspace_id.clone(),
            });

            if let Some(workflow_id) = registry.current_workflow(socket_id) {
                if let Some(room) = registry.workflow_room(&workflow_id) {
                    registry.leave_workflow(socket_id);
                    events.publish(crate::presence::snapshot_event(&room));
                }
            }
            registry.leave_workspace(socket_id);
        }
        info!(user_id = %change.user_id, workspace_id = %change.workspace_id, "evicted revoked user");
        return;
    }

    let Some(new_role) = change.new_role else {
        return;
    };

    for socket_id in &affected_sockets {
        let old = workspace_room.update_role(socket_id, new_role).map(|(_, r)| r);
        events.publish(BrokerEvent::PermissionChanged {
            socket_id: socket_id.clone(),
            old_role: old_role_before_update(old, new_role),
            new_role,
        });

        if let Some(workflow_id) = registry.current_workflow(socket_id) {
            if let Some(room) = registry.workflow_room(&workflow_id) {
                crate::presence::update_role(&room, socket_id, new_role);
                events.publish(crate::presence::snapshot_event(&room));
            }
        }
    }
}

// `WorkspaceRoom::update_role` returns the role *after* the update; the old
// role isn't tracked separately, so for the event payload we only know the
// new one came from somewhere. This helper keeps that honest instead of
// fabricating a before-value.
fn old_role_before_update(_after_update: Option<Role>, _new_role: Role) -> Option<Role> {
    None
}

/// Handles `/api/workflow-deleted` (spec.md §4.7 trigger 2).
///
/// Eviction happens before the notice is published: the set of sockets that
/// were in the room is captured here and carried in the event itself, so the
/// connections that receive it are exactly the ones that were just evicted,
/// not whatever a live membership lookup finds when the socket actor gets
/// around to checking (which could already be empty).
pub fn handle_workflow_deleted(registry: &RoomRegistry, events: &EventBus, notice: WorkflowDeleted) {
    let evicted = registry.evict_workflow(&notice.workflow_id);
    info!(workflow_id = %notice.workflow_id, evicted = evicted.len(), "workflow deleted, room tombstoned");
    events.publish(BrokerEvent::WorkflowDeleted {
        workflow_id: notice.workflow_id.clone(),
        evicted,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{Role, UserIdentity};
    use crate::presence::new_presence;
    use std::time::Duration;

    #[test]
    fn revoke_evicts_every_connection_for_the_user() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let events = EventBus::new();
        let mut rx = events.sender.subscribe();

        registry.join_workspace("ws1", "s1", "u1", Role::Edit);
        let identity = UserIdentity {
            user_id: "u1".into(),
            name: "Ada".into(),
            avatar_ref: None,
        };
        registry.join_workflow("ws1", "wf1", new_presence(&identity, "s1", Role::Edit));

        handle_permission_changed(
            &registry,
            &events,
            PermissionChanged {
                user_id: "u1".into(),
                workspace_id: "ws1".into(),
                new_role: None,
                is_removed: true,
            },
        );

        assert!(registry.current_workflow("s1").is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn deletion_tombstones_the_room() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let events = EventBus::new();
        let identity = UserIdentity {
            user_id: "u1".into(),
            name: "Ada".into(),
            avatar_ref: None,
        };
        registry.join_workflow("ws1", "wf1", new_presence(&identity, "s1", Role::Edit));

        handle_workflow_deleted(
            &registry,
            &events,
            WorkflowDeleted {
                workflow_id: "wf1".into(),
            },
        );

        assert!(registry.is_tombstoned("wf1"));
        assert!(registry.workflow_room("wf1").is_none());
    }

    #[test]
    fn deletion_carries_the_evicted_sockets_in_the_event_itself() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let events = EventBus::new();
        let mut rx = events.sender.subscribe();
        let identity = UserIdentity {
            user_id: "u1".into(),
            name: "Ada".into(),
            avatar_ref: None,
        };
        registry.join_workflow("ws1", "wf1", new_presence(&identity, "s1", Role::Edit));

        handle_workflow_deleted(
            &registry,
            &events,
            WorkflowDeleted {
                workflow_id: "wf1".into(),
            },
        );

        let event = rx.try_recv().unwrap();
        match event.target() {
            crate::events::EventTarget::Sockets(sockets) => {
                assert_eq!(sockets, vec!["s1".to_string()]);
            }
            other => panic!("expected a Sockets target, got {other:?}"),
        }
    }
}
