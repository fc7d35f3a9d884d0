//! SQLite storage implementation.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use super::models::*;
use super::RunStore;
use crate::engine::{NodeRunState, RunSnapshot};
use crate::error::{Error, Result};
use crate::metrics;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

/// Parse a state column stored with `as_str()`.
fn parse_column<T: FromStr<Err = String>>(index: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(Error::Storage(e)),
        )
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(index: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const FLOW_COLUMNS: &str = "f.id, f.name, f.description, f.source, f.status, f.created_at, f.updated_at,
     (SELECT COALESCE(MAX(v.version), 0) FROM flow_versions v WHERE v.flow_id = f.id)";

const RUN_COLUMNS: &str =
    "id, flow_id, flow_name, flow_version, state, trigger, started_at, ended_at, error";

/// SQLite-based storage for flows and finished runs.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&conn)?;
        debug!(path = %path.display(), "Opened flow store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS flow_versions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                flow_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                checksum TEXT NOT NULL,
                FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE,
                UNIQUE(flow_id, version)
            );

            -- Runs outlive their flow record: ad hoc runs of a source file
            -- have no stored flow at all.
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                flow_name TEXT NOT NULL,
                flow_version INTEGER NOT NULL,
                state TEXT NOT NULL,
                trigger TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS node_runs (
                run_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                node_type TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                last_error TEXT,
                outputs TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                PRIMARY KEY (run_id, node_name),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_flow_versions_flow
                ON flow_versions(flow_id, version DESC);
            CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(flow_id, started_at DESC);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Flow operations
    // ========================================================================

    /// Insert or update a flow by name. A new version is recorded whenever
    /// the source differs from the latest version.
    pub async fn save_flow(
        &self,
        name: &str,
        description: &str,
        source: &str,
    ) -> Result<StoredFlow> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let existing: Option<String> = tx
            .query_row("SELECT id FROM flows WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE flows SET description = ?1, source = ?2, updated_at = ?3 WHERE id = ?4",
                    params![description, source, now.to_rfc3339(), id],
                )?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO flows (id, name, description, source, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        id,
                        name,
                        description,
                        source,
                        FlowStatus::Idle.to_string(),
                        now.to_rfc3339()
                    ],
                )?;
                id
            }
        };

        if let Some(version) = Self::record_version_if_changed(&tx, &id, name, source)? {
            debug!(flow = name, version = version.version, "Recorded flow version");
        }

        let flow = Self::query_flow(&tx, "f.id = ?1", &id)?
            .ok_or_else(|| Error::Storage(format!("Flow vanished while saving: {}", name)))?;
        tx.commit()?;
        Ok(flow)
    }

    pub async fn get_flow(&self, name: &str) -> Result<Option<StoredFlow>> {
        let conn = self.conn.lock().await;
        Self::query_flow(&conn, "f.name = ?1", name)
    }

    pub async fn get_flow_by_id(&self, id: &str) -> Result<Option<StoredFlow>> {
        let conn = self.conn.lock().await;
        Self::query_flow(&conn, "f.id = ?1", id)
    }

    pub async fn list_flows(&self) -> Result<Vec<StoredFlow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flows f ORDER BY f.name",
            FLOW_COLUMNS
        ))?;

        let flows = stmt
            .query_map([], Self::row_to_flow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(flows)
    }

    /// Delete a flow and its versions. Returns whether it existed.
    pub async fn delete_flow(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM flows WHERE name = ?1", [name])?;
        Ok(deleted > 0)
    }

    pub async fn set_flow_status(&self, name: &str, status: FlowStatus) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE flows SET status = ?1, updated_at = ?2 WHERE name = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), name],
        )?;
        Ok(updated > 0)
    }

    /// Versions of a flow, newest first.
    pub async fn list_flow_versions(&self, flow_name: &str) -> Result<Vec<FlowVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT v.id, v.flow_id, f.name, v.version, v.source, v.created_at, v.checksum
             FROM flow_versions v JOIN flows f ON f.id = v.flow_id
             WHERE f.name = ?1
             ORDER BY v.version DESC",
        )?;

        let versions = stmt
            .query_map([flow_name], Self::row_to_flow_version)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(versions)
    }

    pub async fn get_flow_version(
        &self,
        flow_name: &str,
        version: u32,
    ) -> Result<Option<FlowVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT v.id, v.flow_id, f.name, v.version, v.source, v.created_at, v.checksum
             FROM flow_versions v JOIN flows f ON f.id = v.flow_id
             WHERE f.name = ?1 AND v.version = ?2",
        )?;

        let record = stmt
            .query_row(params![flow_name, version], Self::row_to_flow_version)
            .optional()?;

        Ok(record)
    }

    // ========================================================================
    // Run operations
    // ========================================================================

    /// Upsert a run and replace its node rows. The owning flow's status is
    /// updated when it is stored.
    pub async fn save_run(&self, snapshot: &RunSnapshot) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO runs
             (id, flow_id, flow_name, flow_version, state, trigger, started_at, ended_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                flow_id = excluded.flow_id,
                flow_name = excluded.flow_name,
                flow_version = excluded.flow_version,
                state = excluded.state,
                trigger = excluded.trigger,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                error = excluded.error",
            params![
                snapshot.run_id,
                snapshot.flow_id,
                snapshot.flow_name,
                snapshot.flow_version,
                snapshot.state.as_str(),
                serde_json::to_string(&snapshot.trigger)?,
                snapshot.started_at.to_rfc3339(),
                snapshot.ended_at.map(|t| t.to_rfc3339()),
                snapshot.error,
            ],
        )?;

        tx.execute("DELETE FROM node_runs WHERE run_id = ?1", [&snapshot.run_id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO node_runs
                 (run_id, node_name, node_type, state, attempt_count, last_error, outputs, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (name, node) in &snapshot.node_states {
                insert.execute(params![
                    snapshot.run_id,
                    name,
                    node.node_type,
                    node.state.as_str(),
                    node.attempt_count,
                    node.last_error,
                    serde_json::to_string(&node.outputs)?,
                    node.started_at.map(|t| t.to_rfc3339()),
                    node.ended_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }

        tx.execute(
            "UPDATE flows SET status = ?1 WHERE id = ?2 OR name = ?3",
            params![
                FlowStatus::after_run(snapshot.state).to_string(),
                snapshot.flow_id,
                snapshot.flow_name
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Rebuild the stored snapshot of a run.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                [run_id],
                Self::row_to_run,
            )
            .optional()?;

        let Some(run) = run else {
            return Ok(None);
        };

        let node_states = Self::query_node_runs(&conn, run_id)?
            .into_iter()
            .map(|node| {
                let outputs = match node.outputs {
                    serde_json::Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                let state = NodeRunState {
                    node_type: node.node_type,
                    state: node.state,
                    attempt_count: node.attempt_count,
                    last_error: node.last_error,
                    started_at: node.started_at,
                    ended_at: node.ended_at,
                    outputs,
                };
                (node.node_name, state)
            })
            .collect::<BTreeMap<_, _>>();

        Ok(Some(RunSnapshot {
            run_id: run.id,
            flow_id: run.flow_id,
            flow_version: run.flow_version,
            flow_name: run.flow_name,
            trigger: run.trigger,
            state: run.state,
            node_states,
            started_at: run.started_at,
            ended_at: run.ended_at,
            error: run.error,
        }))
    }

    /// Most recent runs first, optionally for one flow (by id or name).
    pub async fn list_runs(&self, flow: Option<&str>, limit: usize) -> Result<Vec<StoredRun>> {
        let conn = self.conn.lock().await;
        let limit = if limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            limit.min(MAX_QUERY_LIMIT)
        };

        let runs = match flow {
            Some(flow) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs WHERE flow_id = ?1 OR flow_name = ?1
                     ORDER BY started_at DESC LIMIT ?2",
                    RUN_COLUMNS
                ))?;
                let rows = stmt.query_map(params![flow, limit as i64], Self::row_to_run)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?1",
                    RUN_COLUMNS
                ))?;
                let rows = stmt.query_map([limit as i64], Self::row_to_run)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(runs)
    }

    pub async fn get_node_runs(&self, run_id: &str) -> Result<Vec<StoredNodeRun>> {
        let conn = self.conn.lock().await;
        Self::query_node_runs(&conn, run_id)
    }

    // ========================================================================
    // Row helpers
    // ========================================================================

    fn query_flow(conn: &Connection, filter: &str, key: &str) -> Result<Option<StoredFlow>> {
        let flow = conn
            .query_row(
                &format!("SELECT {} FROM flows f WHERE {}", FLOW_COLUMNS, filter),
                [key],
                Self::row_to_flow,
            )
            .optional()?;
        Ok(flow)
    }

    fn query_node_runs(conn: &Connection, run_id: &str) -> Result<Vec<StoredNodeRun>> {
        let mut stmt = conn.prepare(
            "SELECT run_id, node_name, node_type, state, attempt_count, last_error, outputs, started_at, ended_at
             FROM node_runs WHERE run_id = ?1
             ORDER BY started_at IS NULL, started_at, node_name",
        )?;

        let nodes = stmt
            .query_map([run_id], |row| {
                Ok(StoredNodeRun {
                    run_id: row.get(0)?,
                    node_name: row.get(1)?,
                    node_type: row.get(2)?,
                    state: parse_column(3, &row.get::<_, String>(3)?)?,
                    attempt_count: row.get(4)?,
                    last_error: row.get(5)?,
                    outputs: parse_json_column(6, &row.get::<_, String>(6)?)?,
                    started_at: parse_optional_datetime(row.get(7)?)?,
                    ended_at: parse_optional_datetime(row.get(8)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(nodes)
    }

    fn row_to_flow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFlow> {
        Ok(StoredFlow {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            source: row.get(3)?,
            status: parse_column(4, &row.get::<_, String>(4)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            version: row.get(7)?,
        })
    }

    fn row_to_flow_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowVersion> {
        Ok(FlowVersion {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            flow_name: row.get(2)?,
            version: row.get(3)?,
            source: row.get(4)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            checksum: row.get(6)?,
        })
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRun> {
        Ok(StoredRun {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            flow_name: row.get(2)?,
            flow_version: row.get(3)?,
            state: parse_column(4, &row.get::<_, String>(4)?)?,
            trigger: parse_json_column(5, &row.get::<_, String>(5)?)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            ended_at: parse_optional_datetime(row.get(7)?)?,
            error: row.get(8)?,
        })
    }

    fn record_version_if_changed(
        conn: &Connection,
        flow_id: &str,
        flow_name: &str,
        source: &str,
    ) -> Result<Option<FlowVersion>> {
        let checksum = source_checksum(source);

        let latest: Option<(u32, String)> = conn
            .query_row(
                "SELECT version, checksum FROM flow_versions
                 WHERE flow_id = ?1
                 ORDER BY version DESC
                 LIMIT 1",
                [flow_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((_, latest_checksum)) = &latest {
            if latest_checksum == &checksum {
                return Ok(None);
            }
        }

        let version = FlowVersion {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            flow_name: flow_name.to_string(),
            version: latest.map(|(version, _)| version + 1).unwrap_or(1),
            source: source.to_string(),
            created_at: Utc::now(),
            checksum,
        };

        conn.execute(
            "INSERT INTO flow_versions (id, flow_id, flow_name, version, source, created_at, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version.id,
                version.flow_id,
                version.flow_name,
                version.version,
                version.source,
                version.created_at.to_rfc3339(),
                version.checksum,
            ],
        )?;

        Ok(Some(version))
    }
}

#[async_trait]
impl RunStore for SqliteStorage {
    async fn save_run(&self, snapshot: &RunSnapshot) -> Result<()> {
        let result = SqliteStorage::save_run(self, snapshot).await;
        metrics::record_db_operation("save_run", result.is_ok());
        result
    }
}

fn source_checksum(source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NodeState, RunState, Trigger};
    use serde_json::json;

    fn snapshot(run_id: &str, flow: &str, state: RunState) -> RunSnapshot {
        let started = Utc::now();
        let mut node_states = BTreeMap::new();

        let mut make = NodeRunState::new("set");
        make.state = NodeState::Succeeded;
        make.attempt_count = 1;
        make.started_at = Some(started);
        make.ended_at = Some(started + chrono::Duration::milliseconds(5));
        make.outputs.insert("value".into(), json!({"n": 1}));
        node_states.insert("make".to_string(), make);

        let mut show = NodeRunState::new("debug");
        show.state = if state == RunState::Failed {
            NodeState::FAILED
        } else {
            NodeState::Skipped
        };
        show.attempt_count = 2;
        show.last_error = Some("boom".into());
        node_states.insert("show".to_string(), show);

        RunSnapshot {
            run_id: run_id.to_string(),
            flow_id: flow.to_string(),
            flow_version: 1,
            flow_name: flow.to_string(),
            trigger: Trigger::new("cli", json!({"input": 3})),
            state,
            node_states,
            started_at: started,
            ended_at: Some(started + chrono::Duration::milliseconds(20)),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_flow_crud() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let saved = storage
            .save_flow("nightly", "", r#"flow "nightly" { }"#)
            .await
            .unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(saved.status, FlowStatus::Idle);

        let loaded = storage.get_flow("nightly").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(
            storage.get_flow_by_id(&saved.id).await.unwrap().unwrap().name,
            "nightly"
        );

        storage.save_flow("adhoc", "", r#"flow "adhoc" { }"#).await.unwrap();
        let names: Vec<String> = storage
            .list_flows()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["adhoc", "nightly"]);

        assert!(storage.set_flow_status("nightly", FlowStatus::Stopped).await.unwrap());
        assert!(!storage.set_flow_status("missing", FlowStatus::Stopped).await.unwrap());
        assert_eq!(
            storage.get_flow("nightly").await.unwrap().unwrap().status,
            FlowStatus::Stopped
        );

        assert!(storage.delete_flow("nightly").await.unwrap());
        assert!(!storage.delete_flow("nightly").await.unwrap());
        assert!(storage.get_flow("nightly").await.unwrap().is_none());
        assert!(storage.list_flow_versions("nightly").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_versions_follow_source_changes() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let v1 = r#"flow "etl" { node "a" { type: set } }"#;
        let v2 = r#"flow "etl" { node "a" { type: debug } }"#;

        let first = storage.save_flow("etl", "", v1).await.unwrap();
        let unchanged = storage.save_flow("etl", "", v1).await.unwrap();
        assert_eq!(unchanged.id, first.id);
        assert_eq!(unchanged.version, 1);

        let second = storage.save_flow("etl", "Nightly load", v2).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.description, "Nightly load");
        assert_eq!(second.created_at, first.created_at);

        let versions = storage.list_flow_versions("etl").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[1].source, v1);
        assert_ne!(versions[0].checksum, versions[1].checksum);

        let old = storage.get_flow_version("etl", 1).await.unwrap().unwrap();
        assert_eq!(old.source, v1);
        assert!(storage.get_flow_version("etl", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_round_trip_and_upsert() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut run = snapshot("run-1", "etl", RunState::Failed);

        storage.save_run(&run).await.unwrap();
        let loaded = storage.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, run);

        run.error = Some("node 'show' failed".into());
        run.node_states.remove("show");
        storage.save_run(&run).await.unwrap();

        let loaded = storage.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.error.as_deref(), Some("node 'show' failed"));
        assert_eq!(storage.get_node_runs("run-1").await.unwrap().len(), 1);
        assert!(storage.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_runs() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .save_run(&snapshot("run-1", "etl", RunState::Failed))
            .await
            .unwrap();

        let nodes = storage.get_node_runs("run-1").await.unwrap();
        assert_eq!(nodes.len(), 2);
        // Started nodes first
        assert_eq!(nodes[0].node_name, "make");
        assert_eq!(nodes[0].outputs, json!({"value": {"n": 1}}));
        assert_eq!(nodes[1].state, NodeState::FAILED);
        assert_eq!(nodes[1].attempt_count, 2);
        assert_eq!(nodes[1].last_error.as_deref(), Some("boom"));
        assert!(nodes[1].started_at.is_none());
    }

    #[tokio::test]
    async fn test_list_runs_and_flow_status() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_flow("etl", "", r#"flow "etl" { }"#).await.unwrap();

        let mut first = snapshot("run-1", "etl", RunState::Succeeded);
        first.started_at -= chrono::Duration::seconds(10);
        storage.save_run(&first).await.unwrap();
        storage
            .save_run(&snapshot("run-2", "etl", RunState::Failed))
            .await
            .unwrap();
        storage
            .save_run(&snapshot("run-3", "other", RunState::Cancelled))
            .await
            .unwrap();

        let all = storage.list_runs(None, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        let etl = storage.list_runs(Some("etl"), 10).await.unwrap();
        let ids: Vec<&str> = etl.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["run-2", "run-1"]);
        assert_eq!(etl[0].state, RunState::Failed);
        assert_eq!(etl[0].trigger.kind, "cli");
        assert!(etl[1].duration_ms().unwrap() >= 10_000);

        assert_eq!(storage.list_runs(Some("etl"), 1).await.unwrap().len(), 1);

        // Flow status follows the latest stored run
        let flow = storage.get_flow("etl").await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Error);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowline.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_flow("etl", "", r#"flow "etl" { }"#).await.unwrap();
            storage
                .save_run(&snapshot("run-1", "etl", RunState::Succeeded))
                .await
                .unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        assert!(reopened.get_flow("etl").await.unwrap().is_some());
        assert!(reopened.get_run("run-1").await.unwrap().is_some());

        let conn = reopened.conn.lock().await;
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_run_store_trait() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(storage.clone());
        store
            .save_run(&snapshot("run-1", "etl", RunState::Succeeded))
            .await
            .unwrap();
        assert!(storage.get_run("run-1").await.unwrap().is_some());
    }

    #[test]
    fn test_flow_status_after_run() {
        assert_eq!(FlowStatus::after_run(RunState::Succeeded), FlowStatus::Idle);
        assert_eq!(FlowStatus::after_run(RunState::Failed), FlowStatus::Error);
        assert_eq!(FlowStatus::after_run(RunState::Cancelled), FlowStatus::Stopped);
        assert_eq!("error".parse::<FlowStatus>().unwrap(), FlowStatus::Error);
        assert!("bogus".parse::<FlowStatus>().is_err());
    }
}
