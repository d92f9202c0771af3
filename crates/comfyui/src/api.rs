//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the endpoints the worker needs (health, workflow submission,
//! history retrieval, model listing and refresh) using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::engine::Engine;
use crate::history::PromptHistory;

/// Timeout for a single health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation problems, if the engine reported any.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    /// * `request_timeout` - Upper bound for any single request.
    pub fn new(api_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// Base HTTP URL of the instance.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Probe `GET /system_stats`. Any 2xx answer means the engine is up;
    /// the body is not inspected.
    pub async fn system_stats(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the history entry for a specific prompt.
    ///
    /// Returns `None` while the engine has no entry for the prompt yet
    /// (queued or still executing).
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<PromptHistory>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut entries: IndexMap<String, PromptHistory> = Self::parse_response(response).await?;
        Ok(entries.shift_remove(prompt_id))
    }

    /// Fetch the full node catalogue from `GET /object_info`.
    pub async fn object_info(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Names of the checkpoints the engine can currently load.
    pub async fn checkpoint_names(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let info = self.object_info().await?;
        Ok(extract_checkpoint_names(&info))
    }

    /// Ask the engine to rescan its model folders.
    ///
    /// Querying the checkpoint loader with `refresh=true` forces the
    /// engine to rebuild its model lists.
    pub async fn refresh_models(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info/CheckpointLoaderSimple", self.api_url))
            .query(&[("refresh", "true")])
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Engine for ComfyUIApi {
    async fn is_healthy(&self) -> bool {
        match self.system_stats().await {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn queue_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.submit_workflow(workflow, client_id).await
    }

    async fn prompt_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<PromptHistory>, ComfyUIApiError> {
        self.get_history(prompt_id).await
    }

    async fn refresh_models(&self) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::refresh_models(self).await
    }

    async fn checkpoint_names(&self) -> Result<Vec<String>, ComfyUIApiError> {
        ComfyUIApi::checkpoint_names(self).await
    }
}

/// Pull checkpoint names out of an `object_info` payload.
///
/// The engine has shipped two shapes for the `ckpt_name` input spec:
/// `[[names...], {options}]` and the older flat `[names...]`.
pub fn extract_checkpoint_names(object_info: &serde_json::Value) -> Vec<String> {
    let spec = object_info
        .pointer("/CheckpointLoaderSimple/input/required/ckpt_name")
        .and_then(|v| v.as_array());

    let Some(spec) = spec else {
        return Vec::new();
    };

    let names = match spec.first() {
        Some(serde_json::Value::Array(nested)) => nested.as_slice(),
        _ => spec.as_slice(),
    };

    names
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_names_nested_shape() {
        let info = serde_json::json!({
            "CheckpointLoaderSimple": {"input": {"required": {
                "ckpt_name": [["sdxl.safetensors", "flux.safetensors"], {"tooltip": "x"}]
            }}}
        });
        assert_eq!(
            extract_checkpoint_names(&info),
            ["sdxl.safetensors", "flux.safetensors"]
        );
    }

    #[test]
    fn checkpoint_names_flat_shape() {
        let info = serde_json::json!({
            "CheckpointLoaderSimple": {"input": {"required": {
                "ckpt_name": ["a.ckpt", "b.ckpt"]
            }}}
        });
        assert_eq!(extract_checkpoint_names(&info), ["a.ckpt", "b.ckpt"]);
    }

    #[test]
    fn checkpoint_names_missing_loader() {
        assert!(extract_checkpoint_names(&serde_json::json!({})).is_empty());
        let empty_nested = serde_json::json!({
            "CheckpointLoaderSimple": {"input": {"required": {"ckpt_name": [[]]}}}
        });
        assert!(extract_checkpoint_names(&empty_nested).is_empty());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::with_client(reqwest::Client::new(), "http://127.0.0.1:8188/");
        assert_eq!(api.api_url(), "http://127.0.0.1:8188");
    }
}
