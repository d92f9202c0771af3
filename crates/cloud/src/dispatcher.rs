//! Storage dispatch.
//!
//! A [`StorageDispatcher`] is prepared once per invocation: the volume is
//! probed, and together with the (startup-resolved) object store that
//! fixes the [`StorageMode`]. [`StorageDispatcher::dispatch`] then routes
//! every artifact according to that mode:
//!
//! | Mode          | Object store | Volume  | Link per artifact                         |
//! |---------------|--------------|---------|-------------------------------------------|
//! | `S3Only`      | upload       | -       | URL, or nothing if the upload failed      |
//! | `Both`        | upload       | backup  | URL, volume path if the upload failed     |
//! | `VolumeOnly`  | -            | copy    | volume path                               |
//! | `Unavailable` | -            | -       | fails before any write                    |

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use kiln_core::content_type::content_type_for;
use kiln_core::naming::artifact_key;
use kiln_core::storage::StorageMode;
use kiln_core::types::{ArtifactRef, Timestamp};
use serde::Serialize;

use crate::error::CloudError;
use crate::redact::redact_url;
use crate::store::ObjectStore;
use crate::volume::{copy_to_volume, VolumeTarget};

/// One failed object upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUpload {
    pub source: String,
    pub error: String,
}

/// Upload failures that did not fail the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadWarnings {
    pub failed_uploads: usize,
    pub details: Vec<FailedUpload>,
}

/// Where a job's artifacts ended up.
#[derive(Debug, Clone, Serialize)]
pub struct StorageResult {
    pub mode: StorageMode,
    /// One link per delivered artifact, in artifact order.
    pub links: Vec<String>,
    pub local_paths: Vec<String>,
    pub volume_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<UploadWarnings>,
    /// Bucket name when object storage was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Every artifact reached at least one backend.
    #[serde(skip)]
    pub fully_delivered: bool,
}

pub struct StorageDispatcher {
    mode: StorageMode,
    store: Option<Arc<dyn ObjectStore>>,
    volume_dir: Option<PathBuf>,
}

impl StorageDispatcher {
    /// Probe the volume and resolve the storage mode.
    pub async fn prepare(store: Option<Arc<dyn ObjectStore>>, volume: &VolumeTarget) -> Self {
        let volume_dir = volume.prepare().await;
        let mode = StorageMode::resolve(store.is_some(), volume_dir.is_some());

        tracing::info!(
            mode = ?mode,
            bucket = store.as_ref().map(|s| s.bucket()).unwrap_or("-"),
            volume = %volume.output_dir().display(),
            "Storage mode resolved",
        );

        Self {
            mode,
            store,
            volume_dir,
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Deliver `artifacts` under `job_id`.
    pub async fn dispatch(&self, artifacts: &[ArtifactRef], job_id: &str) -> Result<StorageResult, CloudError> {
        if self.mode == StorageMode::Unavailable {
            return Err(CloudError::Unavailable(
                "object storage is not configured and the volume is not writable".to_string(),
            ));
        }

        let mut result = StorageResult {
            mode: self.mode,
            links: Vec::with_capacity(artifacts.len()),
            local_paths: Vec::with_capacity(artifacts.len()),
            volume_paths: Vec::new(),
            warnings: None,
            bucket: self.store.as_ref().map(|s| s.bucket().to_string()),
            fully_delivered: true,
        };
        let mut failed = Vec::new();
        let mut keys = KeyAllocator::default();

        for artifact in artifacts {
            let key = keys.allocate(job_id, &artifact.filename)?;
            result.local_paths.push(artifact.local_path.display().to_string());

            let volume_path = match &self.volume_dir {
                Some(dir) => match copy_to_volume(dir, &key, &artifact.local_path).await {
                    Ok(path) => {
                        let path = path.display().to_string();
                        result.volume_paths.push(path.clone());
                        Some(path)
                    }
                    Err(e) => {
                        tracing::warn!(job_id, key = %key, error = %e, "Volume copy failed");
                        None
                    }
                },
                None => None,
            };

            let link = match &self.store {
                Some(store) => match self.upload(store.as_ref(), &key, artifact).await {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(job_id, key = %key, error = %e, "Object upload failed");
                        failed.push(FailedUpload {
                            source: artifact.local_path.display().to_string(),
                            error: e.to_string(),
                        });
                        if volume_path.is_some() {
                            tracing::warn!(job_id, file = %artifact.filename, "Using volume path as fallback link");
                        }
                        volume_path
                    }
                },
                None => volume_path,
            };

            match link {
                Some(link) => {
                    tracing::info!(job_id, file = %artifact.filename, link = %redact_url(&link), "Artifact delivered");
                    result.links.push(link);
                }
                None => result.fully_delivered = false,
            }
        }

        if result.links.is_empty() {
            let reason = if failed.is_empty() {
                "failed to save any artifact to the volume".to_string()
            } else {
                let details: Vec<&str> = failed.iter().map(|f| f.error.as_str()).collect();
                format!("every upload failed: {}", details.join("; "))
            };
            return Err(CloudError::Unavailable(reason));
        }

        if !failed.is_empty() {
            result.warnings = Some(UploadWarnings {
                failed_uploads: failed.len(),
                details: failed,
            });
        }

        tracing::info!(
            job_id,
            mode = ?self.mode,
            delivered = result.links.len(),
            total = artifacts.len(),
            "Artifacts dispatched",
        );

        Ok(result)
    }

    async fn upload(&self, store: &dyn ObjectStore, key: &str, artifact: &ArtifactRef) -> Result<String, CloudError> {
        let content_type = content_type_for(&artifact.local_path);
        store.put_file(key, &artifact.local_path, &content_type).await?;
        store.access_url(key).await
    }
}

/// Hands out artifact keys that are unique within one dispatch, even for
/// equal filenames stamped within the same microsecond.
#[derive(Default)]
struct KeyAllocator {
    issued: HashSet<String>,
}

impl KeyAllocator {
    fn allocate(&mut self, job_id: &str, filename: &str) -> Result<String, CloudError> {
        let mut at: Timestamp = Utc::now();
        loop {
            let key = artifact_key(job_id, &at, filename)?;
            if self.issued.insert(key.clone()) {
                return Ok(key);
            }
            at += chrono::Duration::microseconds(1);
        }
    }
}
