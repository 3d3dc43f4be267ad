//! Typed facade over the tiers: the durable local store used by the engine.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{QueueBackend, QueueName, QueuedRow};
use crate::memory::MemoryBackend;
use crate::records::{
    MirroredRecord, NewPendingUpload, PendingUploadRecord, PendingVisitRecord, UploadStatus,
    VisitStatus,
};
use crate::sqlite::SqliteBackend;
use crate::tiered::TieredStore;
use fieldsync_common::{AgentId, Error, Result};

/// Record types that live in a queue store.
trait QueueRecord: Serialize + DeserializeOwned + Send {
    const QUEUE: QueueName;

    fn set_id(&mut self, id: i64);
    fn status_str(&self) -> &'static str;
}

impl QueueRecord for PendingUploadRecord {
    const QUEUE: QueueName = QueueName::PendingUploads;

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn status_str(&self) -> &'static str {
        self.status.as_str()
    }
}

impl QueueRecord for PendingVisitRecord {
    const QUEUE: QueueName = QueueName::PendingVisits;

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn status_str(&self) -> &'static str {
        self.status.as_str()
    }
}

fn decode<R: QueueRecord>(row: QueuedRow) -> Result<R> {
    let mut record: R = serde_json::from_str(&row.body)?;
    record.set_id(row.id);
    Ok(record)
}

/// Durable local store for one device.
///
/// Trip and punch mirrors go through the two-tier key/value store; pending
/// uploads and visits live only in the structured queue store.
#[derive(Clone)]
pub struct LocalStore {
    tiers: TieredStore,
    queues: Arc<dyn QueueBackend>,
}

impl LocalStore {
    pub fn new(tiers: TieredStore, queues: Arc<dyn QueueBackend>) -> Self {
        Self { tiers, queues }
    }

    /// Open the on-device store: memory cache in front of a SQLite database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let durable = Arc::new(SqliteBackend::open(db_path)?);
        let tiers = TieredStore::new(Arc::new(MemoryBackend::new()), durable.clone());
        Ok(Self::new(tiers, durable))
    }

    /// Store that lives only in memory (for testing).
    pub fn ephemeral() -> Self {
        let durable = Arc::new(MemoryBackend::new());
        let tiers = TieredStore::new(Arc::new(MemoryBackend::new()), durable.clone());
        Self::new(tiers, durable)
    }

    /// Mirror a single-record type for its agent, overwriting wholesale.
    pub async fn save_active<R: MirroredRecord>(&self, record: &R) -> Result<()> {
        let key = R::mirror_key(record.agent_id());
        let json = serde_json::to_string(record)?;
        self.tiers.put(&key, &json).await
    }

    /// Load the mirrored record for an agent.
    ///
    /// Unreadable tiers and undecodable values both count as "no record".
    pub async fn load_active<R: MirroredRecord>(&self, agent_id: &AgentId) -> Option<R> {
        let key = R::mirror_key(agent_id);
        let json = self.tiers.get(&key).await?;
        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Discarding undecodable mirror {}: {}", key, e);
                None
            }
        }
    }

    pub async fn clear_active<R: MirroredRecord>(&self, agent_id: &AgentId) -> Result<()> {
        self.tiers.delete(&R::mirror_key(agent_id)).await
    }

    /// Completions recorded offline for an agent, oldest first.
    pub async fn pending_completions<R: MirroredRecord>(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<R>> {
        match self.tiers.get(&R::completions_key(agent_id)).await {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append a completion to the agent's offline queue.
    pub async fn push_pending_completion<R: MirroredRecord>(&self, record: &R) -> Result<()> {
        let key = R::completions_key(record.agent_id());
        let mut queued: Vec<serde_json::Value> = match self.tiers.get(&key).await {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        queued.push(serde_json::to_value(record)?);
        self.tiers.put(&key, &serde_json::to_string(&queued)?).await
    }

    /// Replace the agent's offline completion queue; an empty list deletes it.
    pub async fn save_pending_completions<R: MirroredRecord>(
        &self,
        agent_id: &AgentId,
        records: &[R],
    ) -> Result<()> {
        let key = R::completions_key(agent_id);
        if records.is_empty() {
            self.tiers.delete(&key).await
        } else {
            self.tiers.put(&key, &serde_json::to_string(records)?).await
        }
    }

    /// Raw rows of a queue store with the given status.
    pub async fn query_by_status(&self, queue: QueueName, status: &str) -> Result<Vec<QueuedRow>> {
        self.queues.query_by_status(queue, status).await
    }

    async fn insert<R: QueueRecord>(&self, agent_id: &AgentId, record: &R) -> Result<i64> {
        let body = serde_json::to_string(record)?;
        self.queues
            .insert(R::QUEUE, agent_id.as_str(), record.status_str(), Utc::now(), &body)
            .await
    }

    async fn fetch<R: QueueRecord>(&self, id: i64) -> Result<Option<R>> {
        self.queues.get(R::QUEUE, id).await?.map(decode::<R>).transpose()
    }

    async fn patch<R, F>(&self, id: i64, apply: F) -> Result<R>
    where
        R: QueueRecord,
        F: FnOnce(&mut R) + Send,
    {
        let mut record: R = self
            .fetch(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} record {}", R::QUEUE.table(), id)))?;
        apply(&mut record);
        record.set_id(id);
        let body = serde_json::to_string(&record)?;
        self.queues
            .update(R::QUEUE, id, record.status_str(), &body)
            .await?;
        Ok(record)
    }

    /// Queue an image that could not be sent; returns its local id.
    pub async fn save_pending_upload(&self, upload: NewPendingUpload) -> Result<i64> {
        let agent_id = upload.agent_id.clone();
        let record = upload.into_record();
        let id = self.insert(&agent_id, &record).await?;
        debug!("Queued upload {} ({}) as #{}", record.file_name, record.file_size, id);
        Ok(id)
    }

    /// Every upload still waiting to be delivered, oldest first.
    pub async fn pending_uploads(&self) -> Result<Vec<PendingUploadRecord>> {
        self.queues
            .query_by_status(QueueName::PendingUploads, UploadStatus::Pending.as_str())
            .await?
            .into_iter()
            .map(decode::<PendingUploadRecord>)
            .collect()
    }

    /// Uploads owned by `agent_id` still waiting to be delivered, oldest first.
    pub async fn pending_uploads_for(&self, agent_id: &AgentId) -> Result<Vec<PendingUploadRecord>> {
        let records: Vec<PendingUploadRecord> = self
            .queues
            .query_by_agent(QueueName::PendingUploads, agent_id.as_str())
            .await?
            .into_iter()
            .map(decode::<PendingUploadRecord>)
            .collect::<Result<_>>()?;
        Ok(records
            .into_iter()
            .filter(|u| u.status == UploadStatus::Pending)
            .collect())
    }

    pub async fn pending_upload(&self, id: i64) -> Result<Option<PendingUploadRecord>> {
        self.fetch(id).await
    }

    /// Apply `apply` to a queued upload and persist the result.
    pub async fn update_pending_upload<F>(&self, id: i64, apply: F) -> Result<PendingUploadRecord>
    where
        F: FnOnce(&mut PendingUploadRecord) + Send,
    {
        self.patch(id, apply).await
    }

    pub async fn delete_pending_upload(&self, id: i64) -> Result<()> {
        self.queues.delete(QueueName::PendingUploads, id).await
    }

    /// Queue a visit submission; returns its local id.
    pub async fn save_pending_visit(
        &self,
        agent_id: &AgentId,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let record = PendingVisitRecord {
            id: 0,
            agent_id: agent_id.clone(),
            status: VisitStatus::Pending,
            payload,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        self.insert(agent_id, &record).await
    }

    /// Pending visits owned by `agent_id`, oldest first.
    pub async fn pending_visits(&self, agent_id: &AgentId) -> Result<Vec<PendingVisitRecord>> {
        let records: Vec<PendingVisitRecord> = self
            .queues
            .query_by_agent(QueueName::PendingVisits, agent_id.as_str())
            .await?
            .into_iter()
            .map(decode::<PendingVisitRecord>)
            .collect::<Result<_>>()?;
        Ok(records
            .into_iter()
            .filter(|v| v.status == VisitStatus::Pending)
            .collect())
    }

    pub async fn update_pending_visit<F>(&self, id: i64, apply: F) -> Result<PendingVisitRecord>
    where
        F: FnOnce(&mut PendingVisitRecord) + Send,
    {
        self.patch(id, apply).await
    }

    pub async fn delete_pending_visit(&self, id: i64) -> Result<()> {
        self.queues.delete(QueueName::PendingVisits, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ActivityStatus, TripRecord};
    use fieldsync_common::GeoPosition;
    use tempfile::TempDir;

    fn agent() -> AgentId {
        AgentId::new("agent-1").unwrap()
    }

    fn trip() -> TripRecord {
        TripRecord {
            remote_id: Some("t1".to_string()),
            agent_id: agent(),
            start_location: GeoPosition::new(19.07, 72.87, 10.0),
            start_time: Utc::now(),
            end_location: None,
            end_time: None,
            total_distance: None,
            total_duration: None,
            status: ActivityStatus::Active,
            retroactive: false,
            retroactive_reason: None,
            retroactive_type: None,
            pending_sync: false,
        }
    }

    fn upload(name: &str) -> NewPendingUpload {
        NewPendingUpload {
            file_name: name.to_string(),
            file_type: "image/jpeg".to_string(),
            file_size: 3,
            data_url: "data:image/jpeg;base64,AQID".to_string(),
            agent_id: agent(),
            storage_path: "offline_visits".to_string(),
        }
    }

    #[tokio::test]
    async fn test_active_mirror_lifecycle() {
        let store = LocalStore::ephemeral();
        store.save_active(&trip()).await.unwrap();

        let loaded: TripRecord = store.load_active(&agent()).await.unwrap();
        assert_eq!(loaded.remote_id.as_deref(), Some("t1"));

        store.clear_active::<TripRecord>(&agent()).await.unwrap();
        assert!(store.load_active::<TripRecord>(&agent()).await.is_none());
    }

    #[tokio::test]
    async fn test_mirror_survives_restart() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("device.db");
        {
            let store = LocalStore::open(&db).unwrap();
            store.save_active(&trip()).await.unwrap();
        }
        // New process: empty cache, durable tier answers
        let store = LocalStore::open(&db).unwrap();
        let loaded: Option<TripRecord> = store.load_active(&agent()).await;
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_pending_upload_retry_metadata() {
        let store = LocalStore::ephemeral();
        let id = store.save_pending_upload(upload("a.jpg")).await.unwrap();

        let updated = store
            .update_pending_upload(id, |r| {
                r.retry_count += 1;
                r.last_error = Some("timeout".to_string());
            })
            .await
            .unwrap();
        assert_eq!(updated.id, id);
        assert_eq!(updated.retry_count, 1);

        let pending = store.pending_uploads().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
        assert_eq!(pending[0].status, UploadStatus::Pending);

        store.delete_pending_upload(id).await.unwrap();
        assert!(store.pending_uploads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_visits_are_scoped_to_agent() {
        let store = LocalStore::ephemeral();
        let other = AgentId::new("agent-2").unwrap();
        store
            .save_pending_visit(&agent(), serde_json::json!({"clinic": "north"}))
            .await
            .unwrap();
        store
            .save_pending_visit(&other, serde_json::json!({"clinic": "south"}))
            .await
            .unwrap();

        let mine = store.pending_visits(&agent()).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].payload["clinic"], "north");

        let rows = store
            .query_by_status(QueueName::PendingVisits, "pending")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_uploads_for_agent() {
        let store = LocalStore::ephemeral();
        store.save_pending_upload(upload("mine.jpg")).await.unwrap();
        let mut theirs = upload("theirs.jpg");
        theirs.agent_id = AgentId::new("agent-2").unwrap();
        store.save_pending_upload(theirs).await.unwrap();

        let mine = store.pending_uploads_for(&agent()).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].file_name, "mine.jpg");
        assert_eq!(store.pending_uploads().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_completions_queue() {
        let store = LocalStore::ephemeral();
        assert!(store.pending_completions::<TripRecord>(&agent()).await.unwrap().is_empty());

        let mut first = trip();
        first.status = ActivityStatus::Completed;
        let mut second = trip();
        second.remote_id = None;
        second.status = ActivityStatus::Completed;
        store.push_pending_completion(&first).await.unwrap();
        store.push_pending_completion(&second).await.unwrap();
        // The active mirror is a separate key.
        store.save_active(&trip()).await.unwrap();

        let queued: Vec<TripRecord> = store.pending_completions(&agent()).await.unwrap();
        assert_eq!(queued, vec![first, second.clone()]);

        store
            .save_pending_completions(&agent(), &queued[1..])
            .await
            .unwrap();
        let left: Vec<TripRecord> = store.pending_completions(&agent()).await.unwrap();
        assert_eq!(left, vec![second]);

        store
            .save_pending_completions::<TripRecord>(&agent(), &[])
            .await
            .unwrap();
        assert!(store.pending_completions::<TripRecord>(&agent()).await.unwrap().is_empty());
        assert!(store.load_active::<TripRecord>(&agent()).await.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_upload_is_not_found() {
        let store = LocalStore::ephemeral();
        let err = store.update_pending_upload(7, |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
