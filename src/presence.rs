//! Presence Tracker (spec.md §4.4): builds the `Presence` entries that live
//! inside a `WorkflowRoom` and turns membership/field changes into the
//! broadcast-shaped events the Ingress Adapter publishes.

use crate::events::BrokerEvent;
use crate::models::{Cursor, Presence, PresenceSnapshot, Role, Selection, UserIdentity};
use crate::room_registry::WorkflowRoom;
use chrono::Utc;

pub fn new_presence(identity: &UserIdentity, socket_id: &str, role: Role) -> Presence {
    let now = Utc::now();
    Presence {
        user_id: identity.user_id.clone(),
        user_name: identity.name.clone(),
        avatar_ref: identity.avatar_ref.clone(),
        socket_id: socket_id.to_string(),
        joined_at: now,
        last_activity: now,
        role,
        cursor: None,
        selection: None,
    }
}

/// Full ordered snapshot, emitted on every membership change
/// (spec.md §4.4: "late joiners and reconnectors converge without diffs").
pub fn snapshot_event(room: &WorkflowRoom) -> BrokerEvent {
    BrokerEvent::PresenceUpdate(PresenceSnapshot {
        workflow_id: room.workflow_id.clone(),
        presences: room.snapshot(),
    })
}

/// Mutates only the sender's Presence and returns the delta event.
/// Unthrottled server-side (spec.md §4.4: cursor throttling happens at the
/// client, ~30 Hz; the broker never re-throttles it).
pub fn apply_cursor_update(room: &WorkflowRoom, socket_id: &str, cursor: Cursor) -> Option<BrokerEvent> {
    let presence = room.update_presence(socket_id, |p| {
        p.cursor = Some(cursor);
        p.last_activity = Utc::now();
    })?;
    Some(BrokerEvent::CursorUpdate {
        workflow_id: room.workflow_id.clone(),
        presence,
    })
}

pub fn apply_selection_update(
    room: &WorkflowRoom,
    socket_id: &str,
    selection: Selection,
) -> Option<BrokerEvent> {
    let presence = room.update_presence(socket_id, |p| {
        p.selection = Some(selection);
        p.last_activity = Utc::now();
    })?;
    Some(BrokerEvent::SelectionUpdate {
        workflow_id: room.workflow_id.clone(),
        presence,
    })
}

pub fn update_role(room: &WorkflowRoom, socket_id: &str, role: Role) {
    room.update_presence(socket_id, |p| p.role = role);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room_registry::RoomRegistry;
    use std::time::Duration;

    fn identity() -> UserIdentity {
        UserIdentity {
            user_id: "u1".into(),
            name: "Ada".into(),
            avatar_ref: None,
        }
    }

    #[test]
    fn cursor_update_mutates_only_the_sender() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let (room, _) = registry.join_workflow("ws1", "wf1", new_presence(&identity(), "s1", Role::Edit));
        let event = apply_cursor_update(&room, "s1", Cursor { x: 1.0, y: 2.0 }).unwrap();
        match event {
            BrokerEvent::CursorUpdate { presence, .. } => {
                assert_eq!(presence.cursor.unwrap().x, 1.0);
            }
            _ => panic!("expected cursor update event"),
        }
    }

    #[test]
    fn snapshot_is_ordered_by_join_time() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let (room, _) = registry.join_workflow("ws1", "wf1", new_presence(&identity(), "s1", Role::Edit));
        registry.join_workflow("ws1", "wf1", new_presence(&identity(), "s2", Role::Read));
        let snap = room.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].socket_id, "s1");
    }
}
