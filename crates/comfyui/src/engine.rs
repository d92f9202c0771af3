//! The engine seam.
//!
//! Supervisor, submitter and poller talk to the rendering engine only
//! through [`Engine`], so they can be driven by an in-process fake in
//! tests. [`ComfyUIApi`](crate::api::ComfyUIApi) is the real
//! implementation.

use async_trait::async_trait;

use crate::api::{ComfyUIApiError, SubmitResponse};
use crate::history::PromptHistory;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Whether the engine answers its health endpoint.
    async fn is_healthy(&self) -> bool;

    /// Queue a workflow graph for execution.
    async fn queue_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// History entry for a prompt, `None` while the engine has none.
    async fn prompt_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<PromptHistory>, ComfyUIApiError>;

    /// Ask the engine to rescan its model folders.
    async fn refresh_models(&self) -> Result<(), ComfyUIApiError>;

    /// Checkpoints the engine can load. Used for diagnostics only.
    async fn checkpoint_names(&self) -> Result<Vec<String>, ComfyUIApiError> {
        Ok(Vec::new())
    }
}
