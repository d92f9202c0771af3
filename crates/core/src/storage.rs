//! Storage mode resolution.
//!
//! Which backends a job's artifacts go to is decided once, from two
//! facts: whether object storage is configured and whether the volume is
//! writable. Dispatch logic matches on the resulting [`StorageMode`]
//! instead of re-checking configuration.

use serde::Serialize;

/// Where artifacts are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageMode {
    /// Object storage only; the volume is missing or read-only.
    S3Only,
    /// Persistent volume only; object storage is not configured.
    VolumeOnly,
    /// Object storage is primary for links, the volume holds a backup.
    Both,
    /// Neither backend can take writes.
    Unavailable,
}

impl StorageMode {
    /// Resolve the mode from backend availability.
    pub fn resolve(object_storage_configured: bool, volume_writable: bool) -> Self {
        match (object_storage_configured, volume_writable) {
            (true, true) => Self::Both,
            (true, false) => Self::S3Only,
            (false, true) => Self::VolumeOnly,
            (false, false) => Self::Unavailable,
        }
    }

    /// Whether artifacts are uploaded to object storage.
    pub fn uses_object_storage(self) -> bool {
        matches!(self, Self::S3Only | Self::Both)
    }

    /// Whether artifacts are copied to the volume.
    pub fn uses_volume(self) -> bool {
        matches!(self, Self::VolumeOnly | Self::Both)
    }

    /// The `storage_type` reported to the caller.
    ///
    /// Object storage wins whenever it is used, because the links
    /// returned in that case point at it.
    pub fn storage_type(self) -> Option<&'static str> {
        match self {
            Self::S3Only | Self::Both => Some("s3"),
            Self::VolumeOnly => Some("volume"),
            Self::Unavailable => None,
        }
    }
}
