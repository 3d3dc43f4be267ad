use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fieldsync_common::Result;

/// Opaque reference to an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHandle {
    pub path: String,
}

/// Object storage for uploaded images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path`, replacing any existing object.
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<BlobHandle>;

    /// Public URL for a stored object.
    async fn download_url(&self, handle: &BlobHandle) -> Result<String>;
}
