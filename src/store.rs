//! Durable Workflow Store (spec.md §6 external collaborator, elaborated in
//! SPEC_FULL.md's Operation Pipeline section): read/replace of full workflow
//! state and fine-grained transactional mutation of blocks, edges, subflows,
//! subblocks, and variables.

use crate::errors::{BrokerError, BrokerResult};
use crate::models::WorkflowState;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Mutex;

pub trait WorkflowStore: Send + Sync {
    fn get_state(&self, workflow_id: &str) -> BrokerResult<WorkflowState>;
    fn apply_block_op(&self, workflow_id: &str, operation: &str, payload: &Value) -> BrokerResult<()>;
    fn apply_edge_op(&self, workflow_id: &str, operation: &str, payload: &Value) -> BrokerResult<()>;
    fn apply_subflow_op(&self, workflow_id: &str, operation: &str, payload: &Value) -> BrokerResult<()>;
    fn apply_subblock_value(&self, workflow_id: &str, payload: &Value) -> BrokerResult<()>;
    fn apply_variable_value(&self, workflow_id: &str, payload: &Value) -> BrokerResult<()>;
    fn apply_block_position(&self, workflow_id: &str, payload: &Value) -> BrokerResult<()>;
    fn delete_workflow(&self, workflow_id: &str) -> BrokerResult<()>;
    /// Seeds an empty workflow row so `get_state`/operations have somewhere
    /// to land. Mirrors what the real application tier does on workflow
    /// creation, before the broker ever sees the workflow id.
    fn ensure_workflow(&self, workflow_id: &str, workspace_id: &str) -> BrokerResult<()>;
}

pub struct SqliteWorkflowStore {
    conn: Mutex<Connection>,
}

impl SqliteWorkflowStore {
    pub fn new(path: &str) -> BrokerResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workflows (
                workflow_id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL DEFAULT '',
                loops TEXT NOT NULL DEFAULT '{}',
                parallels TEXT NOT NULL DEFAULT '{}',
                deployment_state TEXT NOT NULL DEFAULT '{}',
                last_saved INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS blocks (
                id TEXT NOT NULL,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
                data TEXT NOT NULL,
                PRIMARY KEY (workflow_id, id)
            );
            CREATE TABLE IF NOT EXISTS edges (
                id TEXT NOT NULL,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
                source_block_id TEXT NOT NULL,
                target_block_id TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (workflow_id, id)
            );
            CREATE TABLE IF NOT EXISTS variables (
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
                variable_id TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (workflow_id, variable_id)
            );",
        )?;
        Ok(())
    }

    fn touch(conn: &Connection, workflow_id: &str) -> BrokerResult<()> {
        conn.execute(
            "INSERT INTO workflows (workflow_id, last_saved) VALUES (?1, ?2)
             ON CONFLICT(workflow_id) DO UPDATE SET last_saved = excluded.last_saved",
            params![workflow_id, now_millis()],
        )?;
        Ok(())
    }

    fn block_exists(conn: &Connection, workflow_id: &str, block_id: &str) -> BrokerResult<bool> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blocks WHERE workflow_id = ?1 AND id = ?2",
                params![workflow_id, block_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn require_str<'a>(payload: &'a Value, field: &str) -> BrokerResult<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::OperationInvalid(format!("missing field '{field}'")))
}

impl WorkflowStore for SqliteWorkflowStore {
    fn get_state(&self, workflow_id: &str) -> BrokerResult<WorkflowState> {
        let conn = self.conn.lock().unwrap();

        let (loops, parallels, deployment_state, last_saved): (String, String, String, i64) = conn
            .query_row(
                "SELECT loops, parallels, deployment_state, last_saved FROM workflows WHERE workflow_id = ?1",
                params![workflow_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?
            .unwrap_or_else(|| ("{}".into(), "{}".into(), "{}".into(), 0));

        let mut blocks_stmt = conn.prepare("SELECT data FROM blocks WHERE workflow_id = ?1")?;
        let blocks: Vec<Value> = blocks_stmt
            .query_map(params![workflow_id], |row| row.get::<_, String>(0))?
            .filter_map(Result::ok)
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect();

        let mut edges_stmt = conn.prepare("SELECT data FROM edges WHERE workflow_id = ?1")?;
        let edges: Vec<Value> = edges_stmt
            .query_map(params![workflow_id], |row| row.get::<_, String>(0))?
            .filter_map(Result::ok)
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect();

        Ok(WorkflowState {
            workflow_id: workflow_id.to_string(),
            blocks: Value::Array(blocks),
            edges: Value::Array(edges),
            loops: serde_json::from_str(&loops).unwrap_or(Value::Object(Default::default())),
            parallels: serde_json::from_str(&parallels)
                .unwrap_or(Value::Object(Default::default())),
            deployment_state: serde_json::from_str(&deployment_state)
                .unwrap_or(Value::Object(Default::default())),
            last_saved,
        })
    }

    fn apply_block_op(&self, workflow_id: &str, operation: &str, payload: &Value) -> BrokerResult<()> {
        let block_id = require_str(payload, "id")?.to_string();
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        match operation {
            "create" | "update" => {
                let data = serde_json::to_string(payload)?;
                tx.execute(
                    "INSERT INTO blocks (id, workflow_id, data) VALUES (?1, ?2, ?3)
                     ON CONFLICT(workflow_id, id) DO UPDATE SET data = excluded.data",
                    params![block_id, workflow_id, data],
                )?;
            }
            "delete" => {
                tx.execute(
                    "DELETE FROM blocks WHERE workflow_id = ?1 AND id = ?2",
                    params![workflow_id, block_id],
                )?;
                // Deleting a block cascades to any edge touching it — a
                // dangling edge would violate the endpoint-existence invariant.
                tx.execute(
                    "DELETE FROM edges WHERE workflow_id = ?1 AND (source_block_id = ?2 OR target_block_id = ?2)",
                    params![workflow_id, block_id],
                )?;
            }
            other => {
                return Err(BrokerError::OperationInvalid(format!(
                    "unknown block operation '{other}'"
                )));
            }
        }

        Self::touch(&tx, workflow_id)?;
        tx.commit()?;
        Ok(())
    }

    fn apply_edge_op(&self, workflow_id: &str, operation: &str, payload: &Value) -> BrokerResult<()> {
        let edge_id = require_str(payload, "id")?.to_string();
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        match operation {
            "create" | "update" => {
                let source = require_str(payload, "sourceBlockId")?.to_string();
                let target = require_str(payload, "targetBlockId")?.to_string();

                if !Self::block_exists(&tx, workflow_id, &source)? {
                    return Err(BrokerError::OperationConflict(format!(
                        "edge source block '{source}' does not exist"
                    )));
                }
                if !Self::block_exists(&tx, workflow_id, &target)? {
                    return Err(BrokerError::OperationConflict(format!(
                        "edge target block '{target}' does not exist"
                    )));
                }

                let data = serde_json::to_string(payload)?;
                tx.execute(
                    "INSERT INTO edges (id, workflow_id, source_block_id, target_block_id, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(workflow_id, id) DO UPDATE SET
                        source_block_id = excluded.source_block_id,
                        target_block_id = excluded.target_block_id,
                        data = excluded.data",
                    params![edge_id, workflow_id, source, target, data],
                )?;
            }
            "delete" => {
                tx.execute(
                    "DELETE FROM edges WHERE workflow_id = ?1 AND id = ?2",
                    params![workflow_id, edge_id],
                )?;
            }
            other => {
                return Err(BrokerError::OperationInvalid(format!(
                    "unknown edge operation '{other}'"
                )));
            }
        }

        Self::touch(&tx, workflow_id)?;
        tx.commit()?;
        Ok(())
    }

    fn apply_subflow_op(&self, workflow_id: &str, operation: &str, payload: &Value) -> BrokerResult<()> {
        let kind = require_str(payload, "kind")?;
        let column = match kind {
            "loop" => "loops",
            "parallel" => "parallels",
            other => {
                return Err(BrokerError::OperationInvalid(format!(
                    "unknown subflow kind '{other}'"
                )));
            }
        };
        let subflow_id = require_str(payload, "id")?.to_string();

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        Self::touch(&tx, workflow_id)?;

        let raw: String = tx
            .query_row(
                &format!("SELECT {column} FROM workflows WHERE workflow_id = ?1"),
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_else(|| "{}".to_string());
        let mut map: serde_json::Map<String, Value> =
            serde_json::from_str(&raw).unwrap_or_default();

        match operation {
            "create" | "update" => {
                map.insert(subflow_id, payload.clone());
            }
            "delete" => {
                map.remove(&subflow_id);
            }
            other => {
                return Err(BrokerError::OperationInvalid(format!(
                    "unknown subflow operation '{other}'"
                )));
            }
        }

        let updated = serde_json::to_string(&Value::Object(map))?;
        tx.execute(
            &format!("UPDATE workflows SET {column} = ?1 WHERE workflow_id = ?2"),
            params![updated, workflow_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn apply_subblock_value(&self, workflow_id: &str, payload: &Value) -> BrokerResult<()> {
        let block_id = require_str(payload, "blockId")?.to_string();
        let subblock_id = require_str(payload, "subblockId")?.to_string();
        let value = payload
            .get("value")
            .ok_or_else(|| BrokerError::OperationInvalid("missing field 'value'".to_string()))?
            .clone();

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let raw: String = tx
            .query_row(
                "SELECT data FROM blocks WHERE workflow_id = ?1 AND id = ?2",
                params![workflow_id, block_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                BrokerError::OperationConflict(format!("block '{block_id}' does not exist"))
            })?;

        let mut block: Value = serde_json::from_str(&raw)?;
        let subblocks = block
            .as_object_mut()
            .and_then(|o| o.entry("subBlocks").or_insert_with(|| Value::Object(Default::default())).as_object_mut())
            .ok_or_else(|| BrokerError::InternalFault("block data is not an object".to_string()))?;
        subblocks.insert(subblock_id, value);

        let data = serde_json::to_string(&block)?;
        tx.execute(
            "UPDATE blocks SET data = ?1 WHERE workflow_id = ?2 AND id = ?3",
            params![data, workflow_id, block_id],
        )?;

        Self::touch(&tx, workflow_id)?;
        tx.commit()?;
        Ok(())
    }

    fn apply_variable_value(&self, workflow_id: &str, payload: &Value) -> BrokerResult<()> {
        let variable_id = require_str(payload, "variableId")?.to_string();
        let value = payload
            .get("value")
            .ok_or_else(|| BrokerError::OperationInvalid("missing field 'value'".to_string()))?
            .clone();

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let data = serde_json::to_string(&value)?;
        tx.execute(
            "INSERT INTO variables (workflow_id, variable_id, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(workflow_id, variable_id) DO UPDATE SET value = excluded.value",
            params![workflow_id, variable_id, data],
        )?;
        Self::touch(&tx, workflow_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Only called for `commit=true` position updates — the pipeline never
    /// calls this for intermediate `commit=false` drags (see Open Questions
    /// in DESIGN.md: discarded, not persisted).
    fn apply_block_position(&self, workflow_id: &str, payload: &Value) -> BrokerResult<()> {
        let block_id = require_str(payload, "blockId")?.to_string();
        let x = payload
            .get("x")
            .and_then(Value::as_f64)
            .ok_or_else(|| BrokerError::OperationInvalid("missing numeric field 'x'".to_string()))?;
        let y = payload
            .get("y")
            .and_then(Value::as_f64)
            .ok_or_else(|| BrokerError::OperationInvalid("missing numeric field 'y'".to_string()))?;

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let raw: String = tx
            .query_row(
                "SELECT data FROM blocks WHERE workflow_id = ?1 AND id = ?2",
                params![workflow_id, block_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                BrokerError::OperationConflict(format!("block '{block_id}' does not exist"))
            })?;

        let mut block: Value = serde_json::from_str(&raw)?;
        if let Some(obj) = block.as_object_mut() {
            obj.insert("x".to_string(), serde_json::json!(x));
            obj.insert("y".to_string(), serde_json::json!(y));
        }

        let data = serde_json::to_string(&block)?;
        tx.execute(
            "UPDATE blocks SET data = ?1 WHERE workflow_id = ?2 AND id = ?3",
            params![data, workflow_id, block_id],
        )?;

        Self::touch(&tx, workflow_id)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_workflow(&self, workflow_id: &str) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM workflows WHERE workflow_id = ?1",
            params![workflow_id],
        )?;
        Ok(())
    }

    fn ensure_workflow(&self, workflow_id: &str, workspace_id: &str) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO workflows (workflow_id, workspace_id, last_saved)
             VALUES (?1, ?2, 0)",
            params![workflow_id, workspace_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteWorkflowStore {
        SqliteWorkflowStore::new(":memory:").unwrap()
    }

    #[test]
    fn creating_a_block_then_fetching_state_round_trips() {
        let store = store();
        store
            .apply_block_op("w1", "create", &serde_json::json!({"id": "b1", "type": "start"}))
            .unwrap();
        let state = store.get_state("w1").unwrap();
        assert_eq!(state.blocks.as_array().unwrap().len(), 1);
    }

    #[test]
    fn edge_creation_fails_when_endpoint_block_is_missing() {
        let store = store();
        store
            .apply_block_op("w1", "create", &serde_json::json!({"id": "b1"}))
            .unwrap();
        let err = store
            .apply_edge_op(
                "w1",
                "create",
                &serde_json::json!({"id": "e1", "sourceBlockId": "b1", "targetBlockId": "missing"}),
            )
            .unwrap_err();
        assert!(matches!(err, BrokerError::OperationConflict(_)));
    }

    #[test]
    fn deleting_a_block_cascades_to_its_edges() {
        let store = store();
        store.apply_block_op("w1", "create", &serde_json::json!({"id": "b1"})).unwrap();
        store.apply_block_op("w1", "create", &serde_json::json!({"id": "b2"})).unwrap();
        store
            .apply_edge_op(
                "w1",
                "create",
                &serde_json::json!({"id": "e1", "sourceBlockId": "b1", "targetBlockId": "b2"}),
            )
            .unwrap();
        store.apply_block_op("w1", "delete", &serde_json::json!({"id": "b1"})).unwrap();
        let state = store.get_state("w1").unwrap();
        assert_eq!(state.edges.as_array().unwrap().len(), 0);
    }

    #[test]
    fn subblock_value_nests_under_the_block() {
        let store = store();
        store.apply_block_op("w1", "create", &serde_json::json!({"id": "b1"})).unwrap();
        store
            .apply_subblock_value(
                "w1",
                &serde_json::json!({"blockId": "b1", "subblockId": "prompt", "value": "hi"}),
            )
            .unwrap();
        let state = store.get_state("w1").unwrap();
        let block = &state.blocks.as_array().unwrap()[0];
        assert_eq!(block["subBlocks"]["prompt"], "hi");
    }

    #[test]
    fn ensure_workflow_is_idempotent_and_does_not_clobber_existing_data() {
        let store = store();
        store.ensure_workflow("w1", "ws1").unwrap();
        store
            .apply_block_op("w1", "create", &serde_json::json!({"id": "b1"}))
            .unwrap();
        store.ensure_workflow("w1", "ws1").unwrap();
        let state = store.get_state("w1").unwrap();
        assert_eq!(state.blocks.as_array().unwrap().len(), 1);
    }

    #[test]
    fn variable_value_upserts() {
        let store = store();
        store
            .apply_variable_value("w1", &serde_json::json!({"variableId": "v1", "value": 42}))
            .unwrap();
        store
            .apply_variable_value("w1", &serde_json::json!({"variableId": "v1", "value": 43}))
            .unwrap();
        // No direct accessor on WorkflowState for variables in this pass;
        // the round trip above asserts the upsert path doesn't error twice.
    }
}
