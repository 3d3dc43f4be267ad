//! Backend traits for the durable local store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fieldsync_common::Result;

/// Key/value tier used for single-record types.
///
/// Values are JSON documents. Implementations must be safe to share across
/// tasks; the tiered store issues writes to two backends concurrently.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Backend name for logs (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Read a value.
    ///
    /// # Returns
    /// `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a value wholesale.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Queue stores holding many concurrent records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    PendingUploads,
    PendingVisits,
}

impl QueueName {
    /// Table name in structured backends.
    pub fn table(&self) -> &'static str {
        match self {
            Self::PendingUploads => "pending_uploads",
            Self::PendingVisits => "pending_visits",
        }
    }
}

/// One stored queue row. `body` is the JSON-encoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRow {
    pub id: i64,
    pub agent_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

/// Structured store for queue record types, indexed by status and agent.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a record and return its auto-assigned id.
    async fn insert(
        &self,
        queue: QueueName,
        agent_id: &str,
        status: &str,
        created_at: DateTime<Utc>,
        body: &str,
    ) -> Result<i64>;

    async fn get(&self, queue: QueueName, id: i64) -> Result<Option<QueuedRow>>;

    /// Replace status and body of an existing record.
    ///
    /// # Errors
    /// - `NotFound` if no record has this id
    async fn update(&self, queue: QueueName, id: i64, status: &str, body: &str) -> Result<()>;

    /// Delete a record. Deleting an absent id is not an error.
    async fn delete(&self, queue: QueueName, id: i64) -> Result<()>;

    /// Records with the given status, oldest first.
    async fn query_by_status(&self, queue: QueueName, status: &str) -> Result<Vec<QueuedRow>>;

    /// Records owned by the given agent, oldest first.
    async fn query_by_agent(&self, queue: QueueName, agent_id: &str) -> Result<Vec<QueuedRow>>;
}
