use std::path::PathBuf;

use serde::Serialize;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A rendering job graph as accepted by the engine (`node id -> node`).
pub type WorkflowGraph = serde_json::Value;

/// A produced file that passed validation.
///
/// Only constructed for files that existed with a non-zero size when
/// they were collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub local_path: PathBuf,
    /// File name as written by the engine.
    pub filename: String,
    pub size_bytes: u64,
}
