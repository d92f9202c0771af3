use std::time::Duration;

use kiln_cloud::error::CloudError;
use kiln_comfyui::submitter::SubmitError;
use kiln_comfyui::supervisor::SupervisorError;
use serde::Serialize;

/// Pipeline stage a job failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Startup,
    Submission,
    Execution,
    Collection,
    Storage,
}

/// Everything that can fail a job.
///
/// Each variant maps to a stable machine-readable code via [`kind`](Self::kind)
/// so callers can classify failures without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Engine failed to start: {0}")]
    Startup(#[from] SupervisorError),

    #[error("{0}")]
    Validation(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Execution failed: {message}")]
    Execution {
        node_id: Option<String>,
        message: String,
    },

    #[error("Job timed out after {}s: {diagnostic}", elapsed.as_secs())]
    Timeout { elapsed: Duration, diagnostic: String },

    #[error("No valid artifacts: {0}")]
    PartialArtifact(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl JobError {
    /// Machine-readable error code.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Startup(_) => "STARTUP_ERROR",
            JobError::Validation(_) => "VALIDATION_ERROR",
            JobError::Submission(_) => "SUBMISSION_ERROR",
            JobError::Execution { .. } => "EXECUTION_ERROR",
            JobError::Timeout { .. } => "TIMEOUT_ERROR",
            JobError::PartialArtifact(_) => "PARTIAL_ARTIFACT_ERROR",
            JobError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            JobError::Startup(_) => Stage::Startup,
            JobError::Validation(_) => Stage::Validation,
            JobError::Submission(_) => Stage::Submission,
            JobError::Execution { .. } | JobError::Timeout { .. } => Stage::Execution,
            JobError::PartialArtifact(_) => Stage::Collection,
            JobError::StorageUnavailable(_) => Stage::Storage,
        }
    }
}

impl From<SubmitError> for JobError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Validation(msg) => JobError::Validation(msg),
            other => JobError::Submission(other.to_string()),
        }
    }
}

impl From<CloudError> for JobError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Unavailable(msg) => JobError::StorageUnavailable(msg),
            other => JobError::StorageUnavailable(other.to_string()),
        }
    }
}
