//! Object storage seam.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::CloudError;

/// An object storage bucket artifacts can be uploaded to.
///
/// [`S3Store`](crate::s3::S3Store) is the production implementation;
/// [`MemoryStore`] backs tests.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Upload the file at `path` under `key`.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), CloudError>;

    /// Link a caller can fetch `key` from: a stable public URL when one
    /// is configured, otherwise a time-limited signed URL.
    async fn access_url(&self, key: &str) -> Result<String, CloudError>;

    /// Bucket name, reported back to the caller.
    fn bucket(&self) -> &str;
}

/// An uploaded object held in memory.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// In-memory object store.
///
/// Uploads whose key contains one of the configured fragments fail,
/// which lets tests exercise partial upload failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    failing: Vec<String>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Fail every upload whose key contains `fragment`.
    pub fn failing_on(mut self, fragment: impl Into<String>) -> Self {
        self.failing.push(fragment.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), CloudError> {
        if self.failing.iter().any(|f| key.contains(f.as_str())) {
            return Err(CloudError::Upload {
                key: key.to_string(),
                message: "simulated upload failure".to_string(),
            });
        }

        let data = tokio::fs::read(path).await.map_err(|e| CloudError::io(path, e))?;
        let mut objects = self.objects.write().map_err(|_| CloudError::Upload {
            key: key.to_string(),
            message: "store lock poisoned".to_string(),
        })?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn access_url(&self, key: &str) -> Result<String, CloudError> {
        Ok(format!("memory://{}/{key}", self.bucket))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
