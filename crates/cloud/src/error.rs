use std::path::PathBuf;

use kiln_core::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Upload of '{key}' failed: {message}")]
    Upload { key: String, message: String },

    #[error("Could not build access URL for '{key}': {message}")]
    AccessUrl { key: String, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Naming(#[from] CoreError),

    /// No backend could take the artifacts.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl CloudError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
