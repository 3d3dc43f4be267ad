//! Upload queue manager.
//!
//! Images are compressed when large, then either sent straight to the blob
//! store or persisted as a [`PendingUploadRecord`] holding the whole payload.
//! From that point an image is represented by exactly one pending record
//! until an upload succeeds, so nothing is lost across restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fieldsync_common::{format_file_size, AgentId, Error, ImageFile, Result};
use fieldsync_storage::{LocalStore, NewPendingUpload, PendingUploadRecord, UploadStatus};

use crate::compress::compress_image;
use crate::config::{CompressionSettings, EngineConfig, UploadSettings};
use crate::data_url;
use crate::network::{ListenerGuard, NetworkMonitor};
use crate::notice::NoticeBus;
use crate::remote::BlobStore;
use crate::retry::RetryExecutor;

/// UI-facing state of one selected image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub id: Uuid,
    pub name: String,
    /// Size of the payload actually sent (after compression).
    pub size: u64,
    pub original_size: u64,
    pub compressed: bool,
    pub status: UploadStatus,
    pub url: Option<String>,
    /// Local id of the pending record while the image is queued.
    pub pending_id: Option<i64>,
    pub error: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// Entry of the uploaded image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub url: String,
    pub file_name: String,
    /// Size before compression.
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Outcome of one [`UploadQueue::drain_queue`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Pending records left after the drain.
    pub remaining: usize,
    /// Set when the drain did not run (offline or already draining).
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Blob path for an upload: `{storage_path}/{agent}/{epoch_millis}_{name}`.
pub fn destination_path(storage_path: &str, agent_id: &AgentId, file_name: &str) -> String {
    format!(
        "{}/{}/{}_{}",
        storage_path,
        agent_id,
        Utc::now().timestamp_millis(),
        file_name
    )
}

/// Resets the syncing flag when a drain finishes.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Image upload queue for one agent.
pub struct UploadQueue {
    agent_id: AgentId,
    store: LocalStore,
    blobs: Arc<dyn BlobStore>,
    network: Arc<NetworkMonitor>,
    notices: NoticeBus,
    compression: CompressionSettings,
    upload: UploadSettings,
    retry: RetryExecutor,
    images: watch::Sender<Vec<ImageDescriptor>>,
    pending_count: watch::Sender<usize>,
    /// Payloads that could not be persisted, kept for a manual retry.
    held: Mutex<HashMap<Uuid, ImageFile>>,
    syncing: AtomicBool,
}

impl UploadQueue {
    pub fn new(
        agent_id: AgentId,
        store: LocalStore,
        blobs: Arc<dyn BlobStore>,
        network: Arc<NetworkMonitor>,
        notices: NoticeBus,
        config: &EngineConfig,
    ) -> Self {
        let (images, _) = watch::channel(Vec::new());
        let (pending_count, _) = watch::channel(0);
        Self {
            agent_id,
            store,
            blobs,
            network,
            notices,
            compression: config.compression.clone(),
            upload: config.upload.clone(),
            retry: RetryExecutor::new(config.retry.to_retry_config()),
            images,
            pending_count,
            held: Mutex::new(HashMap::new()),
            syncing: AtomicBool::new(false),
        }
    }

    /// Reactive list of selected images.
    pub fn images(&self) -> watch::Receiver<Vec<ImageDescriptor>> {
        self.images.subscribe()
    }

    pub fn snapshot(&self) -> Vec<ImageDescriptor> {
        self.images.borrow().clone()
    }

    pub fn image(&self, id: Uuid) -> Option<ImageDescriptor> {
        self.images.borrow().iter().find(|img| img.id == id).cloned()
    }

    /// Reactive number of pending records, for badges.
    pub fn pending_count(&self) -> watch::Receiver<usize> {
        self.pending_count.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Re-read the pending record count from the store.
    pub async fn refresh_pending_count(&self) -> usize {
        match self.store.pending_uploads_for(&self.agent_id).await {
            Ok(records) => {
                let count = records.len();
                self.pending_count.send_replace(count);
                count
            }
            Err(e) => {
                warn!("Could not count pending uploads: {}", e);
                *self.pending_count.borrow()
            }
        }
    }

    /// Manifest of every image in `uploaded` state.
    pub fn uploaded_images(&self) -> Vec<UploadedImage> {
        self.images
            .borrow()
            .iter()
            .filter(|img| img.status == UploadStatus::Uploaded)
            .filter_map(|img| {
                Some(UploadedImage {
                    url: img.url.clone()?,
                    file_name: img.name.clone(),
                    size: img.original_size,
                    uploaded_at: img.uploaded_at?,
                })
            })
            .collect()
    }

    /// Accept a selection of images.
    ///
    /// The whole selection is validated first. Each image is then uploaded
    /// (with backoff) when online, or persisted as a pending record when
    /// offline or when the upload fails.
    pub async fn enqueue(&self, files: Vec<ImageFile>) -> Result<Vec<ImageDescriptor>> {
        if let Err(err) = self.validate(&files) {
            self.notices.error(err.to_string());
            return Err(err);
        }

        let mut ids = Vec::with_capacity(files.len());
        let (mut uploaded, mut queued, mut failed) = (0, 0, 0);

        for file in files {
            let original_size = file.size();
            let (payload, compressed) = self.prepare(file).await;
            let descriptor = ImageDescriptor {
                id: Uuid::new_v4(),
                name: payload.name.clone(),
                size: payload.size(),
                original_size,
                compressed,
                status: UploadStatus::Pending,
                url: None,
                pending_id: None,
                error: None,
                uploaded_at: None,
            };
            let id = descriptor.id;
            self.images.send_modify(|list| list.push(descriptor));
            ids.push(id);

            if !self.network.is_online() {
                if self.queue(id, payload, UploadStatus::Queued, None).await {
                    queued += 1;
                }
                continue;
            }

            self.update_image(id, |img| img.status = UploadStatus::Uploading);
            match self.deliver_with_retry(&payload).await {
                Ok(url) => {
                    self.mark_uploaded(id, url);
                    uploaded += 1;
                }
                Err(err) => {
                    warn!("Upload of {} failed: {}", payload.name, err);
                    let (status, reason) = if self.network.is_online() {
                        (UploadStatus::Error, Some(err.to_string()))
                    } else {
                        (UploadStatus::Queued, None)
                    };
                    if self.queue(id, payload, status, reason).await {
                        if status == UploadStatus::Error {
                            failed += 1;
                        } else {
                            queued += 1;
                        }
                    }
                }
            }
        }

        self.refresh_pending_count().await;
        if uploaded > 0 {
            self.notices
                .success(format!("{} image(s) uploaded successfully", uploaded));
        }
        if queued > 0 {
            self.notices.warning(format!(
                "{} image(s) saved offline. Will upload when connected.",
                queued
            ));
        }
        if failed > 0 {
            self.notices.error(format!(
                "Failed to upload {} image(s). They will be retried when possible.",
                failed
            ));
        }

        let accepted = self
            .snapshot()
            .into_iter()
            .filter(|img| ids.contains(&img.id))
            .collect();
        Ok(accepted)
    }

    /// Deliver every pending record once.
    ///
    /// No-op while offline or while another drain is running. Failed records
    /// stay queued with their retry metadata updated.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        if !self.network.is_online() {
            debug!("Skipping upload drain while offline");
            return Ok(DrainReport::skipped());
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("Upload drain already running");
            return Ok(DrainReport::skipped());
        }
        let _guard = SyncingGuard(&self.syncing);

        let records = self.store.pending_uploads_for(&self.agent_id).await?;
        info!("Draining {} pending uploads for {}", records.len(), self.agent_id);

        let mut report = DrainReport::default();
        for record in records {
            report.attempted += 1;
            let result = match record_payload(&record) {
                Ok(payload) => {
                    self.deliver(&record.agent_id, &record.storage_path, &payload)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(url) => {
                    if let Err(e) = self.store.delete_pending_upload(record.id).await {
                        error!("Uploaded #{} but could not delete it: {}", record.id, e);
                    }
                    if let Some(id) = self.image_for_pending(record.id) {
                        self.mark_uploaded(id, url);
                    }
                    report.uploaded += 1;
                }
                Err(err) => {
                    warn!(
                        "Drain upload of #{} ({}) failed: {}",
                        record.id, record.file_name, err
                    );
                    let message = err.to_string();
                    let msg = message.clone();
                    let updated = self
                        .store
                        .update_pending_upload(record.id, move |r| {
                            r.retry_count += 1;
                            r.last_error = Some(msg);
                        })
                        .await;
                    if let Err(e) = updated {
                        warn!("Could not record retry for #{}: {}", record.id, e);
                    }
                    if let Some(id) = self.image_for_pending(record.id) {
                        self.update_image(id, |img| img.error = Some(message));
                    }
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.refresh_pending_count().await;
        info!(
            "Upload drain finished: {} attempted, {} uploaded, {} failed, {} remaining",
            report.attempted, report.uploaded, report.failed, report.remaining
        );
        if report.uploaded > 0 {
            self.notices.success(format!(
                "{} queued image(s) uploaded successfully",
                report.uploaded
            ));
        }
        Ok(report)
    }

    /// Drop an image from the selection, deleting its pending record if queued.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let descriptor = self
            .image(id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;

        if let Some(pending_id) = descriptor.pending_id {
            self.store.delete_pending_upload(pending_id).await?;
            self.refresh_pending_count().await;
        }
        lock(&self.held).remove(&id);
        self.images.send_modify(|list| list.retain(|img| img.id != id));
        debug!("Removed image {} ({})", descriptor.name, id);
        Ok(())
    }

    /// Try a not-yet-uploaded image again; queues it when offline.
    pub async fn retry(&self, id: Uuid) -> Result<ImageDescriptor> {
        let descriptor = self
            .image(id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;
        if descriptor.status == UploadStatus::Uploaded {
            return Ok(descriptor);
        }

        let payload = match descriptor.pending_id {
            Some(pending_id) => {
                let record = self
                    .store
                    .pending_upload(pending_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("pending upload {}", pending_id)))?;
                record_payload(&record)?
            }
            None => self
                .held_payload(id)
                .ok_or_else(|| Error::NotFound(format!("payload for image {}", id)))?,
        };

        if !self.network.is_online() {
            match descriptor.pending_id {
                Some(_) => self.update_image(id, |img| img.status = UploadStatus::Queued),
                None => {
                    self.queue(id, payload, UploadStatus::Queued, None).await;
                }
            }
            self.refresh_pending_count().await;
            self.notices
                .warning("You are offline. Image queued for upload.");
            return self
                .image(id)
                .ok_or_else(|| Error::NotFound(format!("image {}", id)));
        }

        self.update_image(id, |img| {
            img.status = UploadStatus::Uploading;
            img.error = None;
        });
        match self.deliver_with_retry(&payload).await {
            Ok(url) => {
                if let Some(pending_id) = descriptor.pending_id {
                    if let Err(e) = self.store.delete_pending_upload(pending_id).await {
                        error!("Uploaded #{} but could not delete it: {}", pending_id, e);
                    }
                }
                self.mark_uploaded(id, url);
                self.notices
                    .success(format!("{} uploaded successfully", descriptor.name));
            }
            Err(err) => {
                let message = err.to_string();
                match descriptor.pending_id {
                    Some(pending_id) => {
                        let msg = message.clone();
                        let updated = self
                            .store
                            .update_pending_upload(pending_id, move |r| {
                                r.retry_count += 1;
                                r.last_error = Some(msg);
                            })
                            .await;
                        if let Err(e) = updated {
                            warn!("Could not record retry for #{}: {}", pending_id, e);
                        }
                        self.update_image(id, |img| {
                            img.status = UploadStatus::Error;
                            img.error = Some(message.clone());
                        });
                    }
                    None => {
                        self.queue(id, payload, UploadStatus::Error, Some(message.clone()))
                            .await;
                    }
                }
                self.notices
                    .error(format!("Upload failed: {}", message));
            }
        }

        self.refresh_pending_count().await;
        self.image(id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))
    }

    /// Register connectivity listeners: drain on reconnect, warn when offline.
    pub fn watch_network(self: &Arc<Self>) -> ListenerGuard {
        let queue = Arc::downgrade(self);
        let offline_notices = self.notices.clone();

        self.network.add_listener(
            move || {
                let Some(queue) = queue.upgrade() else {
                    return;
                };
                queue.notices.info("Back online! Syncing data...");
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = queue.drain_queue().await {
                                warn!("Upload drain failed: {}", e);
                            }
                        });
                    }
                    Err(_) => warn!("No runtime available to drain uploads"),
                }
            },
            move || offline_notices.warning("You are offline. Images will be queued for upload."),
        )
    }

    fn validate(&self, files: &[ImageFile]) -> Result<()> {
        let selected = self.images.borrow().len();
        if selected + files.len() > self.upload.max_images {
            return Err(Error::InvalidInput(format!(
                "Maximum {} images allowed",
                self.upload.max_images
            )));
        }
        for file in files {
            if !file.is_image() {
                return Err(Error::InvalidInput(format!(
                    "{} is not an image file",
                    file.name
                )));
            }
            if file.size() > self.upload.max_file_size {
                return Err(Error::InvalidInput(format!(
                    "{} is too large (max {})",
                    file.name,
                    format_file_size(self.upload.max_file_size)
                )));
            }
        }
        Ok(())
    }

    /// Compress large images; fall back to the original on failure.
    async fn prepare(&self, file: ImageFile) -> (ImageFile, bool) {
        if !self.compression.enabled || file.size() <= self.compression.threshold_bytes {
            return (file, false);
        }
        match compress_image(
            file.clone(),
            self.compression.max_width_px,
            self.compression.quality,
        )
        .await
        {
            Ok(compressed) => {
                info!(
                    "Compressed {} from {} to {}",
                    file.name,
                    format_file_size(file.size()),
                    format_file_size(compressed.size())
                );
                (compressed, true)
            }
            Err(e) => {
                warn!("Compression failed for {}, using original: {}", file.name, e);
                (file, false)
            }
        }
    }

    async fn deliver(
        &self,
        agent_id: &AgentId,
        storage_path: &str,
        payload: &ImageFile,
    ) -> Result<String> {
        let path = destination_path(storage_path, agent_id, &payload.name);
        let handle = self
            .blobs
            .upload(&path, payload.data.clone(), &payload.mime_type)
            .await?;
        self.blobs.download_url(&handle).await
    }

    async fn deliver_with_retry(&self, payload: &ImageFile) -> Result<String> {
        self.retry
            .execute(|| self.deliver(&self.agent_id, &self.upload.storage_path, payload))
            .await
    }

    /// Persist `payload` as a pending record and point the descriptor at it.
    ///
    /// Returns false when the image was removed from the selection, in which
    /// case nothing is kept.
    async fn queue(
        &self,
        id: Uuid,
        payload: ImageFile,
        status: UploadStatus,
        reason: Option<String>,
    ) -> bool {
        if self.image(id).is_none() {
            debug!("Image {} was removed, not queueing it", payload.name);
            return false;
        }

        let record = NewPendingUpload {
            file_name: payload.name.clone(),
            file_type: payload.mime_type.clone(),
            file_size: payload.size(),
            data_url: data_url::encode(&payload.mime_type, &payload.data),
            agent_id: self.agent_id.clone(),
            storage_path: self.upload.storage_path.clone(),
        };

        match self.store.save_pending_upload(record).await {
            Ok(pending_id) => {
                lock(&self.held).remove(&id);
                if self.image(id).is_none() {
                    // Removed while the record was being written.
                    if let Err(e) = self.store.delete_pending_upload(pending_id).await {
                        warn!("Could not drop record #{} of removed image: {}", pending_id, e);
                    }
                    return false;
                }
                self.update_image(id, |img| {
                    img.status = status;
                    img.pending_id = Some(pending_id);
                    img.error = reason;
                });
                true
            }
            Err(e) => {
                error!("Could not save {} for later upload: {}", payload.name, e);
                if self.image(id).is_none() {
                    return false;
                }
                lock(&self.held).insert(id, payload);
                self.update_image(id, |img| {
                    img.status = UploadStatus::Error;
                    img.error = Some(format!("Could not save image offline: {}", e));
                });
                true
            }
        }
    }

    fn held_payload(&self, id: Uuid) -> Option<ImageFile> {
        lock(&self.held).get(&id).cloned()
    }

    fn mark_uploaded(&self, id: Uuid, url: String) {
        lock(&self.held).remove(&id);
        if self.image(id).is_none() {
            debug!("Uploaded {} after it was removed from the selection", url);
            return;
        }
        self.update_image(id, |img| {
            img.status = UploadStatus::Uploaded;
            img.url = Some(url);
            img.pending_id = None;
            img.error = None;
            img.uploaded_at = Some(Utc::now());
        });
    }

    fn update_image<F>(&self, id: Uuid, apply: F)
    where
        F: FnOnce(&mut ImageDescriptor),
    {
        self.images.send_modify(|list| {
            if let Some(img) = list.iter_mut().find(|img| img.id == id) {
                apply(img);
            }
        });
    }

    fn image_for_pending(&self, pending_id: i64) -> Option<Uuid> {
        self.images
            .borrow()
            .iter()
            .find(|img| img.pending_id == Some(pending_id))
            .map(|img| img.id)
    }
}

/// Rebuild the uploadable file from a pending record.
fn record_payload(record: &PendingUploadRecord) -> Result<ImageFile> {
    let (mime_type, bytes) = data_url::decode(&record.data_url)?;
    let mime_type = if record.file_type.is_empty() {
        mime_type
    } else {
        record.file_type.clone()
    };
    Ok(ImageFile::new(record.file_name.clone(), mime_type, bytes))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::tests::noisy_png_bytes;
    use crate::remote::MemoryBlobStore;

    struct Fixture {
        queue: Arc<UploadQueue>,
        store: LocalStore,
        blobs: MemoryBlobStore,
        network: Arc<NetworkMonitor>,
    }

    fn fixture(online: bool) -> Fixture {
        let store = LocalStore::ephemeral();
        let blobs = MemoryBlobStore::new();
        let network = Arc::new(NetworkMonitor::new(online));
        network.start();
        let queue = Arc::new(UploadQueue::new(
            AgentId::new("agent-7").unwrap(),
            store.clone(),
            Arc::new(blobs.clone()),
            network.clone(),
            NoticeBus::default(),
            &EngineConfig::default(),
        ));
        Fixture {
            queue,
            store,
            blobs,
            network,
        }
    }

    fn photo(name: &str) -> ImageFile {
        ImageFile::new(name, "image/png", vec![7u8; 2048])
    }

    #[tokio::test]
    async fn test_online_enqueue_uploads() {
        let fx = fixture(true);
        let images = fx.queue.enqueue(vec![photo("a.png")]).await.unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].status, UploadStatus::Uploaded);
        let url = images[0].url.as_deref().unwrap();
        assert!(url.starts_with("memory://offline_visits/agent-7/"));
        assert!(url.ends_with("_a.png"));
        assert_eq!(fx.blobs.len(), 1);
        assert_eq!(*fx.queue.pending_count().borrow(), 0);

        let manifest = fx.queue.uploaded_images();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].file_name, "a.png");
        assert_eq!(manifest[0].size, 2048);
    }

    #[tokio::test]
    async fn test_offline_enqueue_persists_payload() {
        let fx = fixture(false);
        let images = fx.queue.enqueue(vec![photo("b.png")]).await.unwrap();

        assert_eq!(images[0].status, UploadStatus::Queued);
        let pending_id = images[0].pending_id.unwrap();
        let record = fx.store.pending_upload(pending_id).await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.data_url.starts_with("data:image/png;base64,"));
        assert_eq!(record_payload(&record).unwrap().data, vec![7u8; 2048]);
        assert_eq!(*fx.queue.pending_count().borrow(), 1);
        assert!(fx.blobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_online_upload_is_kept() {
        let fx = fixture(true);
        fx.blobs.fail_next_uploads(4);

        let images = fx.queue.enqueue(vec![photo("c.png")]).await.unwrap();
        assert_eq!(images[0].status, UploadStatus::Error);
        assert!(images[0].pending_id.is_some());
        assert!(images[0].error.is_some());
        assert_eq!(fx.store.pending_uploads().await.unwrap().len(), 1);

        let retried = fx.queue.retry(images[0].id).await.unwrap();
        assert_eq!(retried.status, UploadStatus::Uploaded);
        assert!(fx.store.pending_uploads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_failure_updates_retry_metadata() {
        let fx = fixture(false);
        fx.queue.enqueue(vec![photo("d.png")]).await.unwrap();

        fx.network.report(true);
        fx.blobs.fail_next_uploads(1);
        let report = fx.queue.drain_queue().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);

        let record = &fx.store.pending_uploads().await.unwrap()[0];
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.as_deref().unwrap().contains("injected"));

        let report = fx.queue.drain_queue().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(fx.queue.snapshot()[0].status, UploadStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_drain_skipped_offline() {
        let fx = fixture(false);
        fx.queue.enqueue(vec![photo("e.png")]).await.unwrap();
        let report = fx.queue.drain_queue().await.unwrap();
        assert!(report.skipped);
        assert_eq!(fx.store.pending_uploads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_pending_record() {
        let fx = fixture(false);
        let images = fx.queue.enqueue(vec![photo("f.png")]).await.unwrap();

        fx.queue.remove(images[0].id).await.unwrap();
        assert!(fx.queue.snapshot().is_empty());
        assert!(fx.store.pending_uploads().await.unwrap().is_empty());
        assert_eq!(*fx.queue.pending_count().borrow(), 0);
        assert!(matches!(
            fx.queue.remove(images[0].id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_during_upload_leaves_no_record() {
        let fx = fixture(true);
        fx.blobs.fail_next_uploads(4);
        let mut images = fx.queue.images();

        let queue = fx.queue.clone();
        let enqueue = tokio::spawn(async move { queue.enqueue(vec![photo("e.png")]).await });
        images
            .wait_for(|list| list.iter().any(|img| img.status == UploadStatus::Uploading))
            .await
            .unwrap();
        let id = fx.queue.snapshot()[0].id;
        fx.queue.remove(id).await.unwrap();

        let accepted = enqueue.await.unwrap().unwrap();
        assert!(accepted.is_empty());
        assert!(fx.queue.snapshot().is_empty());
        assert!(fx.store.pending_uploads().await.unwrap().is_empty());
        assert_eq!(*fx.queue.pending_count().borrow(), 0);
    }

    #[tokio::test]
    async fn test_drain_only_touches_own_agent() {
        let fx = fixture(false);
        fx.queue.enqueue(vec![photo("mine.png")]).await.unwrap();
        fx.store
            .save_pending_upload(NewPendingUpload {
                file_name: "theirs.png".to_string(),
                file_type: "image/png".to_string(),
                file_size: 3,
                data_url: data_url::encode("image/png", &[1, 2, 3]),
                agent_id: AgentId::new("agent-8").unwrap(),
                storage_path: "offline_visits".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(fx.queue.refresh_pending_count().await, 1);

        fx.network.report(true);
        let report = fx.queue.drain_queue().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.remaining, 0);
        assert!(fx.blobs.paths()[0].starts_with("offline_visits/agent-7/"));

        let left = fx.store.pending_uploads().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].file_name, "theirs.png");
    }

    #[tokio::test]
    async fn test_validation() {
        let fx = fixture(true);

        let not_image = ImageFile::new("notes.txt", "text/plain", vec![1]);
        assert!(matches!(
            fx.queue.enqueue(vec![not_image]).await,
            Err(Error::InvalidInput(_))
        ));

        let huge = ImageFile::new("huge.png", "image/png", vec![0u8; 21 * 1024 * 1024]);
        assert!(fx.queue.enqueue(vec![huge]).await.is_err());

        let four = (0..4).map(|i| photo(&format!("{}.png", i))).collect();
        let err = fx.queue.enqueue(four).await.unwrap_err();
        assert!(err.to_string().contains("Maximum 3 images"));
        assert!(fx.queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_large_images_are_compressed() {
        let fx = fixture(true);
        let big = ImageFile::new("wide.png", "image/png", noisy_png_bytes(1800, 1200));
        assert!(big.size() > 1024 * 1024);

        let images = fx.queue.enqueue(vec![big]).await.unwrap();
        assert!(images[0].compressed);
        assert!(images[0].size < images[0].original_size);

        let path = &fx.blobs.paths()[0];
        assert_eq!(fx.blobs.get(path).unwrap().0, "image/jpeg");
    }

    #[tokio::test]
    async fn test_corrupt_large_image_uploads_original() {
        let fx = fixture(true);
        let corrupt = ImageFile::new("bad.png", "image/png", vec![3u8; 2 * 1024 * 1024]);

        let images = fx.queue.enqueue(vec![corrupt]).await.unwrap();
        assert!(!images[0].compressed);
        assert_eq!(images[0].status, UploadStatus::Uploaded);

        let (mime, bytes) = fx.blobs.get(&fx.blobs.paths()[0]).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![3u8; 2 * 1024 * 1024]);
    }

    #[tokio::test]
    async fn test_offline_retry_keeps_single_record() {
        let fx = fixture(false);
        let images = fx.queue.enqueue(vec![photo("g.png")]).await.unwrap();

        let again = fx.queue.retry(images[0].id).await.unwrap();
        assert_eq!(again.status, UploadStatus::Queued);
        assert_eq!(again.pending_id, images[0].pending_id);
        assert_eq!(fx.store.pending_uploads().await.unwrap().len(), 1);
    }
}
