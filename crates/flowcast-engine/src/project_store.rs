use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use flowcast_core::error::{FlowError, Result};
use flowcast_core::traits::SnapshotSink;
use flowcast_core::types::GraphSnapshot;

/// Snapshots kept per project; older rows are pruned on save.
const KEEP_SNAPSHOTS: i64 = 20;

/// A stored snapshot row.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub snapshot: GraphSnapshot,
    pub saved_at: DateTime<Utc>,
}

/// Project persistence backed by SQLite.
pub struct SqliteProjectStore {
    conn: Mutex<Connection>,
    project: String,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(format!("{}: {}", context, e))
}

impl SqliteProjectStore {
    /// Open or create the project database.
    pub fn open(path: &Path, project: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err("Failed to create store directory", e))?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("Failed to open project store", e))?;
        Self::init(conn, project.into())
    }

    pub fn in_memory(project: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err("Failed to open in-memory store", e))?;
        Self::init(conn, project.into())
    }

    fn init(conn: Connection, project: String) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 project TEXT NOT NULL,
                 node_count INTEGER NOT NULL,
                 edge_count INTEGER NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 saved_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_snapshots_project
                 ON snapshots(project, id DESC);

             CREATE TABLE IF NOT EXISTS credits (
                 project TEXT PRIMARY KEY,
                 balance INTEGER NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| db_err("Failed to initialize project schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
            project,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Append a snapshot and prune old ones. Transient fields are stripped first.
    pub fn save_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let stripped = snapshot.stripped();
        let json = serde_json::to_string(&stripped)?;
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO snapshots (project, node_count, edge_count, snapshot_json, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.project,
                stripped.nodes.len() as i64,
                stripped.edges.len() as i64,
                json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Failed to save snapshot", e))?;

        conn.execute(
            "DELETE FROM snapshots WHERE project = ?1 AND id NOT IN (
                 SELECT id FROM snapshots WHERE project = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![self.project, KEEP_SNAPSHOTS],
        )
        .map_err(|e| db_err("Failed to prune snapshots", e))?;

        debug!(project = %self.project, nodes = stripped.nodes.len(), "Snapshot saved");
        Ok(())
    }

    /// The most recently saved snapshot, if any.
    pub fn load_latest(&self) -> Result<Option<StoredSnapshot>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT snapshot_json, saved_at FROM snapshots
                 WHERE project = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                params![self.project],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| db_err("Failed to load snapshot", e))?;

        let Some((json, saved_at)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredSnapshot {
            snapshot: serde_json::from_str(&json)?,
            saved_at: DateTime::parse_from_rfc3339(&saved_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM snapshots WHERE project = ?1",
                params![self.project],
                |row| row.get(0),
            )
            .map_err(|e| db_err("Failed to count snapshots", e))?;
        Ok(count as usize)
    }

    pub fn save_credits(&self, balance: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO credits (project, balance, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(project) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
            params![self.project, balance as i64, Utc::now().to_rfc3339()],
        )
        .map_err(|e| db_err("Failed to save credits", e))?;
        Ok(())
    }

    pub fn load_credits(&self) -> Result<Option<u64>> {
        let conn = self.lock()?;
        let balance = conn
            .query_row(
                "SELECT balance FROM credits WHERE project = ?1",
                params![self.project],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| db_err("Failed to load credits", e))?;
        Ok(balance.map(|b| b.max(0) as u64))
    }
}

impl SnapshotSink for SqliteProjectStore {
    fn persist(&self, snapshot: GraphSnapshot) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save_snapshot(&snapshot) })
    }

    fn persist_credits(&self, balance: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save_credits(balance) })
    }
}
