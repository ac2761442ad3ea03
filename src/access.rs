//! Access Resolver (spec.md §4.2): resolves a user's [`Role`] on a workspace
//! or workflow, cached on the connection's membership entry until an
//! explicit permission-changed eviction invalidates it.

use crate::errors::BrokerResult;
use crate::models::{Role, UserId, WorkflowId, WorkspaceId};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait AccessResolver: Send + Sync {
    async fn resolve_workspace_access(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> BrokerResult<Option<Role>>;

    async fn resolve_workflow_access(
        &self,
        user_id: &UserId,
        workflow_id: &WorkflowId,
        workspace_id: &WorkspaceId,
    ) -> BrokerResult<Option<Role>> {
        // A workflow's access defaults to its owning workspace's access
        // unless a per-workflow override exists; the local store checks
        // for an override first.
        self.resolve_workspace_access(user_id, workspace_id).await
    }
}

/// Local stand-in for the application tier's permission service, backed by
/// a `permissions` table. Mirrors the teacher's `Db` wrapper: a single
/// blocking `rusqlite::Connection` behind a `Mutex`.
pub struct SqlitePermissionStore {
    conn: Mutex<Connection>,
}

impl SqlitePermissionStore {
    pub fn new(path: &str) -> BrokerResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS permissions (
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (user_id, workspace_id)
            );
            CREATE TABLE IF NOT EXISTS workflow_permission_overrides (
                user_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (user_id, workflow_id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn grant(&self, user_id: &str, workspace_id: &str, role: Role) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO permissions (user_id, workspace_id, role) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, workspace_id) DO UPDATE SET role = excluded.role",
            params![user_id, workspace_id, role_to_str(role)],
        )?;
        Ok(())
    }

    pub fn revoke(&self, user_id: &str, workspace_id: &str) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM permissions WHERE user_id = ?1 AND workspace_id = ?2",
            params![user_id, workspace_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl AccessResolver for SqlitePermissionStore {
    async fn resolve_workspace_access(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> BrokerResult<Option<Role>> {
        let conn = self.conn.lock().unwrap();
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM permissions WHERE user_id = ?1 AND workspace_id = ?2",
                params![user_id, workspace_id],
                |row| row.get(0),
            )
            .ok();
        Ok(role.and_then(|r| str_to_role(&r)))
    }

    async fn resolve_workflow_access(
        &self,
        user_id: &UserId,
        workflow_id: &WorkflowId,
        workspace_id: &WorkspaceId,
    ) -> BrokerResult<Option<Role>> {
        let override_role = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT role FROM workflow_permission_overrides WHERE user_id = ?1 AND workflow_id = ?2",
                params![user_id, workflow_id],
                |row| row.get::<_, String>(0),
            )
            .ok()
        };

        if let Some(role) = override_role.and_then(|r| str_to_role(&r)) {
            return Ok(Some(role));
        }

        self.resolve_workspace_access(user_id, workspace_id).await
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::Read => "read",
        Role::Edit => "edit",
        Role::Admin => "admin",
    }
}

fn str_to_role(s: &str) -> Option<Role> {
    s.parse().ok()
}

/// Calls the application tier's permission service over HTTP.
pub struct HttpAccessResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccessResolver {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build permission service HTTP client");
        Self { client, base_url }
    }
}

#[async_trait]
impl AccessResolver for HttpAccessResolver {
    async fn resolve_workspace_access(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> BrokerResult<Option<Role>> {
        let url = format!(
            "{}/access/{}/{}",
            self.base_url.trim_end_matches('/'),
            workspace_id,
            user_id
        );
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Ok(None);
        }
        #[derive(serde::Deserialize)]
        struct AccessResponse {
            role: String,
        }
        let body: AccessResponse = match resp.json().await {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        Ok(str_to_role(&body.role))
    }
}

pub fn build_resolver(
    config: &crate::config::BrokerConfig,
) -> BrokerResult<Box<dyn AccessResolver>> {
    match &config.permission_service_url {
        Some(url) => Ok(Box::new(HttpAccessResolver::new(url.clone()))),
        None => Ok(Box::new(SqlitePermissionStore::new(&config.database_path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqlitePermissionStore {
        SqlitePermissionStore::new(":memory:").unwrap()
    }

    #[tokio::test]
    async fn unknown_user_has_no_access() {
        let store = store();
        let role = store
            .resolve_workspace_access(&"u1".to_string(), &"w1".to_string())
            .await
            .unwrap();
        assert_eq!(role, None);
    }

    #[tokio::test]
    async fn granted_role_is_resolved() {
        let store = store();
        store.grant("u1", "w1", Role::Edit).unwrap();
        let role = store
            .resolve_workspace_access(&"u1".to_string(), &"w1".to_string())
            .await
            .unwrap();
        assert_eq!(role, Some(Role::Edit));
    }

    #[tokio::test]
    async fn revoke_clears_access() {
        let store = store();
        store.grant("u1", "w1", Role::Admin).unwrap();
        store.revoke("u1", "w1").unwrap();
        let role = store
            .resolve_workspace_access(&"u1".to_string(), &"w1".to_string())
            .await
            .unwrap();
        assert_eq!(role, None);
    }

    #[tokio::test]
    async fn workflow_override_takes_precedence() {
        let store = store();
        store.grant("u1", "w1", Role::Read).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO workflow_permission_overrides (user_id, workflow_id, role) VALUES (?1, ?2, ?3)",
                params!["u1", "wf1", "admin"],
            )
            .unwrap();
        }
        let role = store
            .resolve_workflow_access(&"u1".to_string(), &"wf1".to_string(), &"w1".to_string())
            .await
            .unwrap();
        assert_eq!(role, Some(Role::Admin));
    }
}
