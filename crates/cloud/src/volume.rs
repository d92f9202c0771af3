//! Persistent volume target.

use std::path::{Path, PathBuf};

use crate::error::CloudError;

/// Name of the throwaway file used to prove the volume takes writes.
const WRITE_PROBE: &str = ".kiln_write_probe";

/// Output location on the mounted volume: `{root}/{subdir}`.
#[derive(Debug, Clone)]
pub struct VolumeTarget {
    pub root: PathBuf,
    pub subdir: PathBuf,
}

impl VolumeTarget {
    pub fn new(root: impl Into<PathBuf>, subdir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subdir: subdir.into(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.subdir)
    }

    /// Check the volume can take writes, creating the output directory
    /// if needed. Returns the output directory when writable.
    ///
    /// An unwritable volume is not an error here; the caller decides
    /// whether that leaves any storage at all.
    pub async fn prepare(&self) -> Option<PathBuf> {
        let dir = self.output_dir();

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "Volume output directory unavailable");
            return None;
        }

        let probe = dir.join(format!("{WRITE_PROBE}_{}", std::process::id()));
        if let Err(e) = tokio::fs::write(&probe, b"ok").await {
            tracing::warn!(path = %dir.display(), error = %e, "Volume is not writable");
            return None;
        }
        if let Err(e) = tokio::fs::remove_file(&probe).await {
            tracing::debug!(path = %probe.display(), error = %e, "Could not remove write probe");
        }

        tracing::debug!(path = %dir.display(), "Volume is writable");
        Some(dir)
    }
}

/// Copy `source` to `{output_dir}/{key}`, creating the job directory.
pub async fn copy_to_volume(output_dir: &Path, key: &str, source: &Path) -> Result<PathBuf, CloudError> {
    let dest = output_dir.join(key);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CloudError::io(parent, e))?;
    }
    tokio::fs::copy(source, &dest)
        .await
        .map_err(|e| CloudError::io(source, e))?;
    Ok(dest)
}
