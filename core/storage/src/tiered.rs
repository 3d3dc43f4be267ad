//! Two-tier key/value store: a fast cache in front of a durable backend.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::KvBackend;
use fieldsync_common::{Error, Result};

/// Fast cache plus durable backstop behind one `get/put/delete` interface.
///
/// Writes go to both tiers together. A failing tier is logged and skipped; a
/// write only fails when neither tier accepted it. Reads try the cache first
/// and consult the durable tier on a miss or a read error.
#[derive(Clone)]
pub struct TieredStore {
    cache: Arc<dyn KvBackend>,
    durable: Arc<dyn KvBackend>,
}

impl TieredStore {
    pub fn new(cache: Arc<dyn KvBackend>, durable: Arc<dyn KvBackend>) -> Self {
        Self { cache, durable }
    }

    /// Overwrite `key` in both tiers.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let (cached, durable) = tokio::join!(self.cache.put(key, value), self.durable.put(key, value));
        self.settle("write", key, cached, durable)
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let (cached, durable) = tokio::join!(self.cache.delete(key), self.durable.delete(key));
        self.settle("delete", key, cached, durable)
    }

    /// Read `key`, preferring the cache.
    ///
    /// Tier failures are treated as empty, so this never errors.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.cache.get(key).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => debug!("Cache miss for {}, reading {}", key, self.durable.name()),
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        match self.durable.get(key).await {
            Ok(Some(value)) => {
                if let Err(e) = self.cache.put(key, &value).await {
                    debug!("Could not re-warm cache for {}: {}", key, e);
                }
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Durable read failed for {}: {}", key, e);
                None
            }
        }
    }

    fn settle(&self, op: &str, key: &str, cached: Result<()>, durable: Result<()>) -> Result<()> {
        match (cached, durable) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                warn!("{} {} failed on {} tier: {}", op, key, self.durable.name(), e);
                Ok(())
            }
            (Err(e), Ok(())) => {
                warn!("{} {} failed on {} tier: {}", op, key, self.cache.name(), e);
                Ok(())
            }
            (Err(cache_err), Err(durable_err)) => Err(Error::Storage(format!(
                "{} {} failed on both tiers: {}; {}",
                op, key, cache_err, durable_err
            ))),
        }
    }
}
