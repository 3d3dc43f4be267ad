//! SQLite backend: the durable structured tier.
//!
//! Holds the key/value mirror of single-record types plus one table per
//! queue, indexed by status, agent and creation time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::backend::{KvBackend, QueueBackend, QueueName, QueuedRow};
use fieldsync_common::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_records (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pending_uploads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_uploads_status ON pending_uploads(status);
    CREATE INDEX IF NOT EXISTS idx_pending_uploads_agent ON pending_uploads(agent_id);
    CREATE INDEX IF NOT EXISTS idx_pending_uploads_created ON pending_uploads(created_at);

    CREATE TABLE IF NOT EXISTS pending_visits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_visits_status ON pending_visits(status);
    CREATE INDEX IF NOT EXISTS idx_pending_visits_agent ON pending_visits(agent_id);
    CREATE INDEX IF NOT EXISTS idx_pending_visits_created ON pending_visits(created_at);
"#;

type RawRow = (i64, String, String, String, String);

/// SQLite-backed store.
///
/// Calls run on the blocking pool so they never stall the async executor.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        info!("Durable store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Storage("connection lock poisoned".to_string()))?;
            op(&guard).map_err(storage_err)
        })
        .await
        .map_err(|e| Error::Storage(format!("storage task failed: {}", e)))?
    }

    async fn select_rows(
        &self,
        queue: QueueName,
        column: &'static str,
        value: &str,
    ) -> Result<Vec<QueuedRow>> {
        let sql = format!(
            "SELECT id, agent_id, status, created_at, body FROM {} \
             WHERE {} = ?1 ORDER BY created_at, id",
            queue.table(),
            column
        );
        let value = value.to_string();
        let raw = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([value], read_raw)?;
                rows.collect::<rusqlite::Result<Vec<RawRow>>>()
            })
            .await?;
        raw.into_iter().map(into_row).collect()
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_row((id, agent_id, status, created_at, body): RawRow) -> Result<QueuedRow> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| Error::Storage(format!("bad created_at on row {}: {}", id, e)))?
        .with_timezone(&Utc);
    Ok(QueuedRow {
        id,
        agent_id,
        status,
        created_at,
        body,
    })
}

#[async_trait]
impl KvBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_records WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        debug!("Writing durable record: {}", key);
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv_records (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!("Deleting durable record: {}", key);
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_records WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl QueueBackend for SqliteBackend {
    async fn insert(
        &self,
        queue: QueueName,
        agent_id: &str,
        status: &str,
        created_at: DateTime<Utc>,
        body: &str,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (agent_id, status, created_at, body) VALUES (?1, ?2, ?3, ?4)",
            queue.table()
        );
        let agent_id = agent_id.to_string();
        let status = status.to_string();
        let created_at = created_at.to_rfc3339();
        let body = body.to_string();
        self.with_conn(move |conn| {
            conn.execute(&sql, params![agent_id, status, created_at, body])?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get(&self, queue: QueueName, id: i64) -> Result<Option<QueuedRow>> {
        let sql = format!(
            "SELECT id, agent_id, status, created_at, body FROM {} WHERE id = ?1",
            queue.table()
        );
        let raw = self
            .with_conn(move |conn| conn.query_row(&sql, [id], read_raw).optional())
            .await?;
        raw.map(into_row).transpose()
    }

    async fn update(&self, queue: QueueName, id: i64, status: &str, body: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?1, body = ?2 WHERE id = ?3",
            queue.table()
        );
        let status = status.to_string();
        let body = body.to_string();
        let changed = self
            .with_conn(move |conn| conn.execute(&sql, params![status, body, id]))
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("{} record {}", queue.table(), id)));
        }
        Ok(())
    }

    async fn delete(&self, queue: QueueName, id: i64) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", queue.table());
        self.with_conn(move |conn| conn.execute(&sql, [id]).map(|_| ()))
            .await
    }

    async fn query_by_status(&self, queue: QueueName, status: &str) -> Result<Vec<QueuedRow>> {
        self.select_rows(queue, "status", status).await
    }

    async fn query_by_agent(&self, queue: QueueName, agent_id: &str) -> Result<Vec<QueuedRow>> {
        self.select_rows(queue, "agent_id", agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_upsert_and_delete() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.put("active_trip_a", "{\"v\":1}").await.unwrap();
        backend.put("active_trip_a", "{\"v\":2}").await.unwrap();

        let value = KvBackend::get(&backend, "active_trip_a").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"v\":2}"));

        KvBackend::delete(&backend, "active_trip_a").await.unwrap();
        assert!(KvBackend::get(&backend, "active_trip_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_rows_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("device.db");

        let id = {
            let backend = SqliteBackend::open(&db_path).unwrap();
            backend
                .insert(
                    QueueName::PendingUploads,
                    "agent-1",
                    "pending",
                    Utc::now(),
                    "{\"fileName\":\"a.jpg\"}",
                )
                .await
                .unwrap()
        };

        let backend = SqliteBackend::open(&db_path).unwrap();
        let rows = backend
            .query_by_status(QueueName::PendingUploads, "pending")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].agent_id, "agent-1");
    }

    #[tokio::test]
    async fn test_update_and_query_by_agent() {
        let backend = SqliteBackend::in_memory().unwrap();
        let q = QueueName::PendingVisits;
        let id = backend
            .insert(q, "agent-1", "pending", Utc::now(), "{}")
            .await
            .unwrap();
        backend.insert(q, "agent-2", "pending", Utc::now(), "{}").await.unwrap();

        backend.update(q, id, "pending", "{\"retryCount\":1}").await.unwrap();
        let row = QueueBackend::get(&backend, q, id).await.unwrap().unwrap();
        assert_eq!(row.body, "{\"retryCount\":1}");

        let mine = backend.query_by_agent(q, "agent-1").await.unwrap();
        assert_eq!(mine.len(), 1);

        let err = backend.update(q, 999, "pending", "{}").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        QueueBackend::delete(&backend, q, id).await.unwrap();
        assert!(QueueBackend::get(&backend, q, id).await.unwrap().is_none());
    }
}
