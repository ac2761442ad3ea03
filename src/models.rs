//! The broker's data model (spec.md §3): connections, presence, rooms, and
//! the wire DTOs that cross the socket and HTTP boundaries.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub type SocketId = String;
pub type UserId = String;
pub type WorkspaceId = String;
pub type WorkflowId = String;

/// Read < Edit < Admin, totally ordered (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Edit,
    Admin,
}

impl Role {
    fn rank(self) -> u8 {
        match self {
            Role::Read => 0,
            Role::Edit => 1,
            Role::Admin => 2,
        }
    }

    pub fn can_mutate(self) -> bool {
        self.rank() >= Role::Edit.rank()
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Role::Read),
            "edit" => Ok(Role::Edit),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The identity resolved once at authentication and attached to a Connection
/// for its lifetime (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub name: String,
    pub avatar_ref: Option<String>,
}

/// A live socket connection. Created on handshake success, destroyed on
/// disconnect, never reused (spec.md §3).
#[derive(Debug, Clone)]
pub struct Connection {
    pub socket_id: SocketId,
    pub identity: UserIdentity,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionKind {
    Block,
    Edge,
    None,
}

impl Serialize for SelectionKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let v = match self {
            SelectionKind::Block => "block",
            SelectionKind::Edge => "edge",
            SelectionKind::None => "none",
        };
        s.serialize_str(v)
    }
}

impl<'de> Deserialize<'de> for SelectionKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match s.as_str() {
            "block" => Ok(SelectionKind::Block),
            "edge" => Ok(SelectionKind::Edge),
            "none" => Ok(SelectionKind::None),
            other => Err(serde::de::Error::custom(format!(
                "unknown selection kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub kind: SelectionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Live metadata about a participant in a workflow room (spec.md §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub user_name: String,
    pub avatar_ref: Option<String>,
    pub socket_id: SocketId,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// The `operationId`-identified client mutation request (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation_id: String,
    pub operation: String,
    pub target: TargetKind,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub client_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Block,
    Edge,
    Subflow,
    Subblock,
    Variable,
}

/// Outcome of a committed operation (spec.md §8: "all other Connections
/// receive exactly one broadcast with the same operationId").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub target: TargetKind,
    pub operation: String,
    pub payload: serde_json::Value,
    pub server_timestamp: i64,
    pub originating_socket: SocketId,
}

/// Workspace resource fanout tuple from the Ingress Adapter (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Env,
    Tools,
    Folders,
    Mcp,
    Workflows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceResourceChanged {
    pub workspace_id: WorkspaceId,
    pub resource_type: ResourceType,
    pub operation: ResourceOperation,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionChanged {
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub new_role: Option<Role>,
    pub is_removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDeleted {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowUpdated {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReverted {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotWorkflowEdit {
    pub workflow_id: WorkflowId,
}

/// The authoritative snapshot returned for `request-sync` (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub blocks: serde_json::Value,
    pub edges: serde_json::Value,
    pub loops: serde_json::Value,
    pub parallels: serde_json::Value,
    pub deployment_state: serde_json::Value,
    pub last_saved: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceSnapshot {
    pub workflow_id: WorkflowId,
    pub presences: Vec<Presence>,
}
