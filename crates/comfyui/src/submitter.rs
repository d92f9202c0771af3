//! Workflow validation and submission.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::api::ComfyUIApiError;
use crate::engine::Engine;

/// A workflow accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSubmission {
    /// Engine-assigned tracking id; every later poll uses it.
    pub prompt_id: String,
    pub job_id: String,
    /// Client id sent along with the prompt.
    pub client_id: String,
    /// Queue position reported by the engine.
    pub queue_number: i64,
}

/// Errors from validating or submitting a workflow.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid workflow: {0}")]
    Validation(String),

    #[error("Engine rejected the workflow ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to reach the engine: {0}")]
    Transport(String),

    #[error("Engine accepted the workflow but returned no prompt id")]
    MissingPromptId,
}

impl From<ComfyUIApiError> for SubmitError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::ApiError { status, body } => Self::Rejected { status, body },
            ComfyUIApiError::Request(e) => Self::Transport(e.to_string()),
        }
    }
}

/// Check that `workflow` is a well-formed node graph.
///
/// The graph must be a non-empty object mapping node ids to node objects.
/// Each node needs a string `class_type`; `inputs`, when present, must be
/// an object. Inputs shaped like `[node_id, output_index]` are links and
/// must point at a node in the same graph.
pub fn validate_workflow(workflow: Option<&Value>) -> Result<&Map<String, Value>, SubmitError> {
    let workflow = match workflow {
        None | Some(Value::Null) => {
            return Err(SubmitError::Validation("workflow is missing".into()));
        }
        Some(w) => w,
    };

    let nodes = workflow
        .as_object()
        .ok_or_else(|| SubmitError::Validation("workflow must be an object of node id -> node".into()))?;

    if nodes.is_empty() {
        return Err(SubmitError::Validation("workflow has no nodes".into()));
    }

    for (node_id, node) in nodes {
        let node = node
            .as_object()
            .ok_or_else(|| SubmitError::Validation(format!("node {node_id} is not an object")))?;

        match node.get("class_type") {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => {
                return Err(SubmitError::Validation(format!(
                    "node {node_id} has no class_type"
                )));
            }
        }

        let inputs = match node.get("inputs") {
            None => continue,
            Some(Value::Object(inputs)) => inputs,
            Some(_) => {
                return Err(SubmitError::Validation(format!(
                    "node {node_id} inputs must be an object"
                )));
            }
        };

        for (name, value) in inputs {
            if let Some(target) = link_target(value) {
                if !nodes.contains_key(target) {
                    return Err(SubmitError::Validation(format!(
                        "node {node_id} input {name} references missing node {target}"
                    )));
                }
            }
        }
    }

    Ok(nodes)
}

/// `Some(node_id)` when the input value is a `[node_id, index]` link.
fn link_target(value: &Value) -> Option<&str> {
    match value.as_array()?.as_slice() {
        [Value::String(id), idx] if idx.is_u64() => Some(id.as_str()),
        _ => None,
    }
}

/// Node types whose outputs end up on disk.
fn output_node_count(nodes: &Map<String, Value>) -> usize {
    nodes
        .values()
        .filter_map(|n| n.get("class_type").and_then(Value::as_str))
        .filter(|ty| {
            let ty = ty.to_ascii_lowercase();
            ty.contains("save") || ty.contains("videocombine")
        })
        .count()
}

/// Posts validated workflows to the engine.
pub struct JobSubmitter {
    engine: Arc<dyn Engine>,
}

impl JobSubmitter {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Validate and queue `workflow`. The submission is never retried.
    pub async fn submit(&self, workflow: &Value, job_id: &str) -> Result<WorkflowSubmission, SubmitError> {
        let nodes = validate_workflow(Some(workflow))?;
        let client_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            job_id,
            nodes = nodes.len(),
            output_nodes = output_node_count(nodes),
            "Submitting workflow",
        );

        let response = self.engine.queue_prompt(workflow, &client_id).await?;

        if has_node_errors(&response.node_errors) {
            tracing::warn!(job_id, node_errors = %response.node_errors, "Engine reported node errors on submission");
        }

        let prompt_id = response
            .prompt_id
            .filter(|id| !id.is_empty())
            .ok_or(SubmitError::MissingPromptId)?;

        tracing::info!(job_id, prompt_id = %prompt_id, queue_number = response.number, "Workflow queued");

        Ok(WorkflowSubmission {
            prompt_id,
            job_id: job_id.to_string(),
            client_id,
            queue_number: response.number,
        })
    }
}

fn has_node_errors(node_errors: &Value) -> bool {
    match node_errors {
        Value::Object(m) => !m.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Null => false,
        _ => true,
    }
}
