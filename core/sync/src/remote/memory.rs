//! In-memory ledger and blob store.
//!
//! Used for tests and local development. Both can be switched offline and
//! told to fail a number of upcoming writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use fieldsync_common::{Error, Result};

use super::blob::{BlobHandle, BlobStore};
use super::ledger::{
    ActiveSnapshots, DocumentPath, Fields, LedgerDocument, LedgerWrite, RemoteLedger,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consume one scripted failure, if any are left.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct LedgerInner {
    documents: Mutex<HashMap<DocumentPath, BTreeMap<String, Fields>>>,
    online: AtomicBool,
    failures: AtomicU32,
    query_failures: AtomicU32,
    next_id: AtomicU64,
    writes: AtomicU64,
    version: watch::Sender<u64>,
}

impl LedgerInner {
    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Network("ledger unreachable".to_string()))
        }
    }

    fn check_write(&self) -> Result<()> {
        self.check_reachable()?;
        if take_failure(&self.failures) {
            return Err(Error::Network("injected ledger failure".to_string()));
        }
        Ok(())
    }

    fn active(&self, path: &DocumentPath, order_by: &str) -> Option<LedgerDocument> {
        let documents = lock(&self.documents);
        let collection = documents.get(path)?;
        let newest = collection
            .iter()
            .filter(|(_, fields)| fields.get("status").and_then(Value::as_str) == Some("active"))
            .max_by(|(_, a), (_, b)| sort_key(a, order_by).cmp(&sort_key(b, order_by)))
            .map(|(id, fields)| LedgerDocument {
                id: id.clone(),
                fields: fields.clone(),
            });
        newest
    }
}

/// Order timestamps chronologically, anything else lexically.
fn sort_key(fields: &Fields, order_by: &str) -> (Option<DateTime<Utc>>, String) {
    match fields.get(order_by).and_then(Value::as_str) {
        Some(raw) => (raw.parse::<DateTime<Utc>>().ok(), raw.to_string()),
        None => (None, String::new()),
    }
}

fn apply(target: &mut Fields, write: LedgerWrite) {
    let now = Value::String(Utc::now().to_rfc3339());
    for (key, value) in write.fields {
        target.insert(key, value);
    }
    for key in write.server_timestamps {
        target.insert(key, now.clone());
    }
}

/// In-memory [`RemoteLedger`].
#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(LedgerInner {
                documents: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                failures: AtomicU32::new(0),
                query_failures: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
                writes: AtomicU64::new(0),
                version,
            }),
        }
    }

    /// Simulate losing or regaining the connection. Going offline ends
    /// open subscriptions with an error.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        self.inner.bump();
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Fail the next `count` writes with a network error.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` active queries with a network error.
    pub fn fail_next_queries(&self, count: u32) {
        self.inner.query_failures.store(count, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Every document under `path`, in creation order.
    pub fn documents(&self, path: &DocumentPath) -> Vec<LedgerDocument> {
        lock(&self.inner.documents)
            .get(path)
            .map(|collection| {
                collection
                    .iter()
                    .map(|(id, fields)| LedgerDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of documents with `status == "active"` under `path`.
    pub fn active_count(&self, path: &DocumentPath) -> usize {
        self.documents(path)
            .iter()
            .filter(|doc| doc.status() == Some("active"))
            .count()
    }

    fn insert(&self, path: &DocumentPath, write: LedgerWrite) -> String {
        let id = format!("doc-{:06}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let mut fields = Fields::new();
        apply(&mut fields, write);
        lock(&self.inner.documents)
            .entry(path.clone())
            .or_default()
            .insert(id.clone(), fields);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.bump();
        id
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteLedger for MemoryLedger {
    async fn create(&self, path: &DocumentPath, write: LedgerWrite) -> Result<String> {
        self.inner.check_write()?;
        let id = self.insert(path, write);
        debug!("Created {}/{}", path, id);
        Ok(id)
    }

    async fn update(&self, path: &DocumentPath, id: &str, write: LedgerWrite) -> Result<()> {
        self.inner.check_write()?;
        {
            let mut documents = lock(&self.inner.documents);
            let fields = documents
                .get_mut(path)
                .and_then(|collection| collection.get_mut(id))
                .ok_or_else(|| Error::NotFound(format!("{}/{}", path, id)))?;
            apply(fields, write);
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.bump();
        debug!("Updated {}/{}", path, id);
        Ok(())
    }

    async fn query_active(
        &self,
        path: &DocumentPath,
        order_by: &str,
    ) -> Result<Option<LedgerDocument>> {
        self.inner.check_reachable()?;
        if take_failure(&self.inner.query_failures) {
            return Err(Error::Network("injected query failure".to_string()));
        }
        Ok(self.inner.active(path, order_by))
    }

    fn subscribe_active(&self, path: &DocumentPath, order_by: &str) -> ActiveSnapshots {
        struct Subscription {
            inner: Arc<LedgerInner>,
            version: watch::Receiver<u64>,
            path: DocumentPath,
            order_by: String,
            last: Option<Option<LedgerDocument>>,
            first: bool,
            done: bool,
        }

        let state = Subscription {
            inner: self.inner.clone(),
            version: self.inner.version.subscribe(),
            path: path.clone(),
            order_by: order_by.to_string(),
            last: None,
            first: true,
            done: false,
        };

        futures::stream::unfold(state, |mut sub| async move {
            if sub.done {
                return None;
            }
            loop {
                if !sub.first && sub.version.changed().await.is_err() {
                    return None;
                }
                sub.first = false;

                if let Err(err) = sub.inner.check_reachable() {
                    sub.done = true;
                    return Some((Err(err), sub));
                }
                let snapshot = sub.inner.active(&sub.path, &sub.order_by);
                if sub.last.as_ref() != Some(&snapshot) {
                    sub.last = Some(snapshot.clone());
                    return Some((Ok(snapshot), sub));
                }
            }
        })
        .boxed()
    }
}

/// In-memory [`BlobStore`].
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<BTreeMap<String, (String, Vec<u8>)>>>,
    offline: Arc<AtomicBool>,
    failures: Arc<AtomicU32>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Fail the next `count` uploads with a network error.
    pub fn fail_next_uploads(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Stored object paths.
    pub fn paths(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Content type and bytes stored at `path`.
    pub fn get(&self, path: &str) -> Option<(String, Vec<u8>)> {
        lock(&self.objects).get(path).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<BlobHandle> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("blob store unreachable".to_string()));
        }
        if take_failure(&self.failures) {
            return Err(Error::Network("injected upload failure".to_string()));
        }
        debug!("Stored blob {} ({} bytes)", path, data.len());
        lock(&self.objects).insert(path.to_string(), (content_type.to_string(), data));
        Ok(BlobHandle {
            path: path.to_string(),
        })
    }

    async fn download_url(&self, handle: &BlobHandle) -> Result<String> {
        if !lock(&self.objects).contains_key(&handle.path) {
            return Err(Error::NotFound(handle.path.clone()));
        }
        Ok(format!("memory://{}", handle.path))
    }
}
