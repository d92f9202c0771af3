//! ComfyUI history entries and their interpretation.
//!
//! `GET /history/{prompt_id}` answers `{"<prompt_id>": {...}}` once the
//! engine has started tracking the prompt. Each entry carries a status
//! block and the per-node outputs:
//!
//! ```json
//! {
//!   "status": {"status_str": "success", "completed": true, "messages": [["execution_start", {}]]},
//!   "outputs": {"9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]}}
//! }
//! ```

use indexmap::IndexMap;
use serde::Deserialize;

/// File type the engine uses for throwaway previews.
const TEMP_FILE_TYPE: &str = "temp";

/// One prompt's history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptHistory {
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    /// Node outputs in the order the engine reported them.
    #[serde(default)]
    pub outputs: IndexMap<String, NodeOutput>,
}

/// Status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"` once finished.
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// Execution messages as `[kind, data]` pairs.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

/// Outputs of a single node. Keys other than file lists are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub videos: Vec<OutputFile>,
}

/// A file reference inside a node output list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputFile {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A produced file, tagged with the node that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
}

/// A node-level failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub message: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.node_id, &self.node_type) {
            (Some(id), Some(ty)) => write!(f, "node {id} ({ty}): {}", self.message),
            (Some(id), None) => write!(f, "node {id}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// What a history entry says about the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    Running,
    Succeeded(Vec<OutputRef>),
    Failed(NodeFailure),
}

impl PromptHistory {
    /// Interpret the status block.
    pub fn state(&self) -> HistoryState {
        let Some(status) = &self.status else {
            return HistoryState::Running;
        };

        match status.status_str.as_deref() {
            Some("success") => HistoryState::Succeeded(self.output_refs()),
            Some("error") => HistoryState::Failed(status.failure()),
            None if status.completed => HistoryState::Succeeded(self.output_refs()),
            _ => HistoryState::Running,
        }
    }

    /// Every non-preview file reference, in engine order.
    pub fn output_refs(&self) -> Vec<OutputRef> {
        let mut refs = Vec::new();

        for (node_id, output) in &self.outputs {
            for files in [&output.images, &output.gifs, &output.videos] {
                refs.extend(
                    files
                        .iter()
                        .filter(|f| !f.filename.is_empty() && f.kind != TEMP_FILE_TYPE)
                        .map(|f| OutputRef {
                            node_id: node_id.clone(),
                            filename: f.filename.clone(),
                            subfolder: f.subfolder.clone(),
                        }),
                );
            }
        }

        refs
    }
}

impl HistoryStatus {
    /// Pull the failing node out of the `execution_error` message.
    fn failure(&self) -> NodeFailure {
        let error = self
            .messages
            .iter()
            .find(|(kind, _)| kind == "execution_error")
            .map(|(_, data)| data);

        let Some(data) = error else {
            let interrupted = self
                .messages
                .iter()
                .any(|(kind, _)| kind == "execution_interrupted");
            return NodeFailure {
                node_id: None,
                node_type: None,
                message: if interrupted {
                    "execution was interrupted".to_string()
                } else {
                    "engine reported an error without details".to_string()
                },
            };
        };

        let field = |name: &str| data.get(name).and_then(|v| v.as_str()).map(String::from);

        let message = match (field("exception_type"), field("exception_message")) {
            (Some(ty), Some(msg)) => format!("{ty}: {}", msg.trim()),
            (None, Some(msg)) => msg.trim().to_string(),
            (Some(ty), None) => ty,
            (None, None) => "execution error".to_string(),
        };

        NodeFailure {
            node_id: field("node_id"),
            node_type: field("node_type"),
            message,
        }
    }
}
