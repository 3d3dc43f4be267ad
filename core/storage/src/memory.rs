//! In-memory backend: the fast cache tier, and a stand-in structured store for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{KvBackend, QueueBackend, QueueName, QueuedRow};
use fieldsync_common::{Error, Result};

/// In-memory backend.
///
/// All data is lost on drop. `set_unavailable` makes every call fail, which is
/// how tests simulate a broken tier.
pub struct MemoryBackend {
    values: RwLock<HashMap<String, String>>,
    queues: RwLock<HashMap<QueueName, BTreeMap<i64, QueuedRow>>>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every key/value entry, as a cache eviction would.
    pub fn evict_all(&self) {
        self.values_mut().clear();
    }

    /// Number of key/value entries held.
    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory backend unavailable".to_string()));
        }
        Ok(())
    }

    // A panic while holding a lock cannot leave a half-written map behind,
    // so poisoned locks are recovered rather than propagated.
    fn values(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn values_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.values.write().unwrap_or_else(|e| e.into_inner())
    }

    fn queues(&self) -> RwLockReadGuard<'_, HashMap<QueueName, BTreeMap<i64, QueuedRow>>> {
        self.queues.read().unwrap_or_else(|e| e.into_inner())
    }

    fn queues_mut(&self) -> RwLockWriteGuard<'_, HashMap<QueueName, BTreeMap<i64, QueuedRow>>> {
        self.queues.write().unwrap_or_else(|e| e.into_inner())
    }

    fn filtered<F>(&self, queue: QueueName, keep: F) -> Vec<QueuedRow>
    where
        F: Fn(&QueuedRow) -> bool,
    {
        let mut rows: Vec<QueuedRow> = self
            .queues()
            .get(&queue)
            .map(|rows| rows.values().filter(|r| keep(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.values().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.values_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.values_mut().remove(key);
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn insert(
        &self,
        queue: QueueName,
        agent_id: &str,
        status: &str,
        created_at: DateTime<Utc>,
        body: &str,
    ) -> Result<i64> {
        self.check_available()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = QueuedRow {
            id,
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            created_at,
            body: body.to_string(),
        };
        self.queues_mut().entry(queue).or_default().insert(id, row);
        Ok(id)
    }

    async fn get(&self, queue: QueueName, id: i64) -> Result<Option<QueuedRow>> {
        self.check_available()?;
        Ok(self.queues().get(&queue).and_then(|rows| rows.get(&id).cloned()))
    }

    async fn update(&self, queue: QueueName, id: i64, status: &str, body: &str) -> Result<()> {
        self.check_available()?;
        let mut queues = self.queues_mut();
        let row = queues
            .get_mut(&queue)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| Error::NotFound(format!("{} record {}", queue.table(), id)))?;
        row.status = status.to_string();
        row.body = body.to_string();
        Ok(())
    }

    async fn delete(&self, queue: QueueName, id: i64) -> Result<()> {
        self.check_available()?;
        if let Some(rows) = self.queues_mut().get_mut(&queue) {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn query_by_status(&self, queue: QueueName, status: &str) -> Result<Vec<QueuedRow>> {
        self.check_available()?;
        Ok(self.filtered(queue, |r| r.status == status))
    }

    async fn query_by_agent(&self, queue: QueueName, agent_id: &str) -> Result<Vec<QueuedRow>> {
        self.check_available()?;
        Ok(self.filtered(queue, |r| r.agent_id == agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        backend.put("k", "{\"a\":1}").await.unwrap();
        assert_eq!(
            KvBackend::get(&backend, "k").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );

        KvBackend::delete(&backend, "k").await.unwrap();
        assert!(KvBackend::get(&backend, "k").await.unwrap().is_none());
        // Deleting twice is fine
        KvBackend::delete(&backend, "k").await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        assert!(backend.put("k", "v").await.is_err());
        assert!(KvBackend::get(&backend, "k").await.is_err());

        backend.set_unavailable(false);
        backend.put("k", "v").await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_indexes() {
        let backend = MemoryBackend::new();
        let q = QueueName::PendingVisits;
        let now = Utc::now();

        let a = backend.insert(q, "agent-a", "pending", now, "{}").await.unwrap();
        let b = backend.insert(q, "agent-b", "pending", now, "{}").await.unwrap();
        backend.insert(q, "agent-a", "done", now, "{}").await.unwrap();
        assert_ne!(a, b);

        assert_eq!(backend.query_by_status(q, "pending").await.unwrap().len(), 2);
        assert_eq!(backend.query_by_agent(q, "agent-a").await.unwrap().len(), 2);
        // Other queues are isolated
        assert!(backend
            .query_by_status(QueueName::PendingUploads, "pending")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .update(QueueName::PendingUploads, 42, "pending", "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
