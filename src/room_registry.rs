//! Room Registry (spec.md §4.3): the single process-wide directory of
//! workflow rooms and workspace rooms. Generalizes the teacher's
//! `PresenceTracker`/`TypingTracker` pattern — an `Arc<RwLock<HashMap<...>>>`
//! singleton managed by Rocket — from one flat map to the two-level
//! workflow/workspace directory spec.md §3 requires.

use crate::models::{Presence, Role, SocketId, UserId, WorkflowId, WorkspaceId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

pub struct WorkflowRoom {
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    presences: StdMutex<HashMap<SocketId, Presence>>,
    pub last_modified: StdMutex<i64>,
    /// Held for the duration of authorize→validate→apply→confirm. Never
    /// taken while `presences` is locked, and never held across an await
    /// that also needs `presences`.
    pub operation_lock: AsyncMutex<()>,
}

impl WorkflowRoom {
    fn new(workflow_id: WorkflowId, workspace_id: WorkspaceId) -> Self {
        Self {
            workflow_id,
            workspace_id,
            presences: StdMutex::new(HashMap::new()),
            last_modified: StdMutex::new(0),
            operation_lock: AsyncMutex::new(()),
        }
    }

    pub fn insert_presence(&self, presence: Presence) {
        self.presences
            .lock()
            .unwrap()
            .insert(presence.socket_id.clone(), presence);
    }

    pub fn remove_presence(&self, socket_id: &str) -> Option<Presence> {
        self.presences.lock().unwrap().remove(socket_id)
    }

    pub fn get_presence(&self, socket_id: &str) -> Option<Presence> {
        self.presences.lock().unwrap().get(socket_id).cloned()
    }

    pub fn update_presence<F: FnOnce(&mut Presence)>(&self, socket_id: &str, f: F) -> Option<Presence> {
        let mut map = self.presences.lock().unwrap();
        let presence = map.get_mut(socket_id)?;
        f(presence);
        Some(presence.clone())
    }

    pub fn snapshot(&self) -> Vec<Presence> {
        let map = self.presences.lock().unwrap();
        let mut values: Vec<Presence> = map.values().cloned().collect();
        values.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        values
    }

    pub fn connection_count(&self) -> usize {
        self.presences.lock().unwrap().len()
    }

    pub fn unique_user_count(&self) -> usize {
        let map = self.presences.lock().unwrap();
        map.values()
            .map(|p| p.user_id.clone())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    pub fn bump_last_modified(&self, ts: i64) {
        *self.last_modified.lock().unwrap() = ts;
    }
}

pub struct WorkspaceRoom {
    pub workspace_id: WorkspaceId,
    members: StdMutex<HashMap<SocketId, (UserId, Role)>>,
}

impl WorkspaceRoom {
    fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            members: StdMutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, socket_id: SocketId, user_id: UserId, role: Role) {
        self.members.lock().unwrap().insert(socket_id, (user_id, role));
    }

    pub fn remove(&self, socket_id: &str) -> Option<(UserId, Role)> {
        self.members.lock().unwrap().remove(socket_id)
    }

    pub fn update_role(&self, socket_id: &str, role: Role) -> Option<(UserId, Role)> {
        let mut map = self.members.lock().unwrap();
        let entry = map.get_mut(socket_id)?;
        entry.1 = role;
        Some(entry.clone())
    }

    pub fn members_for_user(&self, user_id: &str) -> Vec<SocketId> {
        let map = self.members.lock().unwrap();
        map.iter()
            .filter(|(_, (uid, _))| uid == user_id)
            .map(|(sid, _)| sid.clone())
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn socket_ids(&self) -> Vec<SocketId> {
        self.members.lock().unwrap().keys().cloned().collect()
    }
}

struct Tombstone {
    expires_at: Instant,
}

/// The process-wide directory (`rocket::State`). All durable-store-free
/// membership changes are cheap synchronous map operations; nothing here
/// is ever held across an `.await`.
pub struct RoomRegistry {
    workflow_rooms: RwLock<HashMap<WorkflowId, Arc<WorkflowRoom>>>,
    workspace_rooms: RwLock<HashMap<WorkspaceId, Arc<WorkspaceRoom>>>,
    socket_to_workflow: StdMutex<HashMap<SocketId, WorkflowId>>,
    socket_to_workspace: StdMutex<HashMap<SocketId, (WorkspaceId, Role)>>,
    tombstones: StdMutex<HashMap<WorkflowId, Tombstone>>,
    tombstone_ttl: Duration,
}

impl RoomRegistry {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            workflow_rooms: RwLock::new(HashMap::new()),
            workspace_rooms: RwLock::new(HashMap::new()),
            socket_to_workflow: StdMutex::new(HashMap::new()),
            socket_to_workspace: StdMutex::new(HashMap::new()),
            tombstones: StdMutex::new(HashMap::new()),
            tombstone_ttl,
        }
    }

    pub fn is_tombstoned(&self, workflow_id: &str) -> bool {
        let tombstones = self.tombstones.lock().unwrap();
        tombstones
            .get(workflow_id)
            .map(|t| t.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn tombstone(&self, workflow_id: &str) {
        let mut tombstones = self.tombstones.lock().unwrap();
        tombstones.insert(
            workflow_id.to_string(),
            Tombstone {
                expires_at: Instant::now() + self.tombstone_ttl,
            },
        );
    }

    /// Removes expired entries; called periodically by the tombstone sweep task.
    pub fn sweep_tombstones(&self) -> usize {
        let mut tombstones = self.tombstones.lock().unwrap();
        let before = tombstones.len();
        let now = Instant::now();
        tombstones.retain(|_, t| t.expires_at > now);
        before - tombstones.len()
    }

    pub fn workflow_room(&self, workflow_id: &str) -> Option<Arc<WorkflowRoom>> {
        self.workflow_rooms.read().unwrap().get(workflow_id).cloned()
    }

    pub fn workspace_room(&self, workspace_id: &str) -> Option<Arc<WorkspaceRoom>> {
        self.workspace_rooms.read().unwrap().get(workspace_id).cloned()
    }

    pub fn current_workflow(&self, socket_id: &str) -> Option<WorkflowId> {
        self.socket_to_workflow.lock().unwrap().get(socket_id).cloned()
    }

    pub fn current_workspace(&self, socket_id: &str) -> Option<(WorkspaceId, Role)> {
        self.socket_to_workspace.lock().unwrap().get(socket_id).cloned()
    }

    /// Joins `workflow_id`, leaving any previously-joined workflow room
    /// first (spec.md §4.3: "leaves the previous workflow if any"). Returns
    /// the room and the id of the room that was left, if any.
    pub fn join_workflow(
        &self,
        workspace_id: &str,
        workflow_id: &str,
        presence: Presence,
    ) -> (Arc<WorkflowRoom>, Option<WorkflowId>) {
        let socket_id = presence.socket_id.clone();
        let previous = self.leave_workflow(&socket_id);

        let room = {
            let mut rooms = self.workflow_rooms.write().unwrap();
            rooms
                .entry(workflow_id.to_string())
                .or_insert_with(|| {
                    Arc::new(WorkflowRoom::new(
                        workflow_id.to_string(),
                        workspace_id.to_string(),
                    ))
                })
                .clone()
        };

        room.insert_presence(presence);
        self.socket_to_workflow
            .lock()
            .unwrap()
            .insert(socket_id, workflow_id.to_string());

        (room, previous)
    }

    /// Removes the connection from its current workflow room, destroying
    /// the room if it was the last member. Returns the left room's id.
    pub fn leave_workflow(&self, socket_id: &str) -> Option<WorkflowId> {
        let workflow_id = self.socket_to_workflow.lock().unwrap().remove(socket_id)?;

        let room = self.workflow_rooms.read().unwrap().get(&workflow_id).cloned();
        if let Some(room) = room {
            room.remove_presence(socket_id);
            if room.connection_count() == 0 {
                self.workflow_rooms.write().unwrap().remove(&workflow_id);
            }
        }

        Some(workflow_id)
    }

    pub fn join_workspace(&self, workspace_id: &str, socket_id: &str, user_id: &str, role: Role) -> Arc<WorkspaceRoom> {
        self.leave_workspace(socket_id);

        let room = {
            let mut rooms = self.workspace_rooms.write().unwrap();
            rooms
                .entry(workspace_id.to_string())
                .or_insert_with(|| Arc::new(WorkspaceRoom::new(workspace_id.to_string())))
                .clone()
        };

        room.insert(socket_id.to_string(), user_id.to_string(), role);
        self.socket_to_workspace
            .lock()
            .unwrap()
            .insert(socket_id.to_string(), (workspace_id.to_string(), role));

        room
    }

    pub fn leave_workspace(&self, socket_id: &str) -> Option<WorkspaceId> {
        let (workspace_id, _) = self.socket_to_workspace.lock().unwrap().remove(socket_id)?;

        let room = self.workspace_rooms.read().unwrap().get(&workspace_id).cloned();
        if let Some(room) = room {
            room.remove(socket_id);
            if room.member_count() == 0 {
                self.workspace_rooms.write().unwrap().remove(&workspace_id);
            }
        }

        Some(workspace_id)
    }

    /// Removes every trace of a disconnected connection, regardless of
    /// which rooms it was in. Called once from the socket actor's teardown.
    pub fn disconnect(&self, socket_id: &str) {
        self.leave_workflow(socket_id);
        self.leave_workspace(socket_id);
    }

    /// Tombstones a workflow room and evicts every member, returning the
    /// sockets that were present so the caller can notify them.
    pub fn evict_workflow(&self, workflow_id: &str) -> Vec<SocketId> {
        self.tombstone(workflow_id);
        let room = self.workflow_rooms.write().unwrap().remove(workflow_id);
        let Some(room) = room else {
            return Vec::new();
        };
        let sockets: Vec<SocketId> = room.snapshot().into_iter().map(|p| p.socket_id).collect();
        let mut index = self.socket_to_workflow.lock().unwrap();
        for socket_id in &sockets {
            index.remove(socket_id);
        }
        sockets
    }

    /// `(workflow rooms, workspace rooms, connections)` for the health endpoint.
    pub fn counts(&self) -> (usize, usize, usize) {
        let workflow_rooms = self.workflow_rooms.read().unwrap();
        let workspace_rooms = self.workspace_rooms.read().unwrap();
        let connections = workflow_rooms.values().map(|r| r.connection_count()).sum();
        (workflow_rooms.len(), workspace_rooms.len(), connections)
    }
}
