//! Shared fakes and builders for worker integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use kiln_cloud::store::ObjectStore;
use kiln_comfyui::api::{ComfyUIApiError, SubmitResponse};
use kiln_comfyui::engine::Engine;
use kiln_comfyui::history::PromptHistory;
use kiln_comfyui::launcher::Launcher;
use kiln_worker::config::WorkerConfig;
use kiln_worker::handler::{JobHandler, RunRequest};
use kiln_worker::routes;
use kiln_worker::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

/// What the fake engine does with a submitted prompt.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write these files to the output directory and report them.
    Produce(Vec<String>),
    /// Write these files but finish with an empty output list.
    Unreported(Vec<String>),
    /// Report a node failure.
    FailNode { node_id: String, message: String },
    /// Never reach a terminal state.
    Hang,
}

/// In-process stand-in for ComfyUI.
pub struct FakeEngine {
    pub healthy: AtomicBool,
    pub health_checks: AtomicU32,
    pub submissions: AtomicU32,
    pub refreshes: AtomicU32,
    output_dir: PathBuf,
    behavior: Mutex<Behavior>,
}

impl FakeEngine {
    pub fn new(output_dir: &Path, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(false),
            health_checks: AtomicU32::new(0),
            submissions: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
            output_dir: output_dir.to_path_buf(),
            behavior: Mutex::new(behavior),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn history(&self) -> Value {
        match self.behavior.lock().unwrap().clone() {
            Behavior::Produce(files) => {
                let images: Vec<Value> = files
                    .iter()
                    .map(|f| json!({"filename": f, "subfolder": "", "type": "output"}))
                    .collect();
                json!({
                    "status": {"status_str": "success", "completed": true, "messages": []},
                    "outputs": {"9": {"images": images}}
                })
            }
            Behavior::Unreported(_) => json!({
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": {}
            }),
            Behavior::FailNode { node_id, message } => json!({
                "status": {"status_str": "error", "completed": false, "messages": [
                    ["execution_error", {
                        "node_id": node_id,
                        "node_type": "KSampler",
                        "exception_type": "RuntimeError",
                        "exception_message": message
                    }]
                ]},
                "outputs": {}
            }),
            Behavior::Hang => json!({"status": {"status_str": null, "completed": false, "messages": []}}),
        }
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn is_healthy(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }

    async fn queue_prompt(&self, _workflow: &Value, _client_id: &str) -> Result<SubmitResponse, ComfyUIApiError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Produce(files) => {
                for file in files {
                    std::fs::write(self.output_dir.join(file), b"rendered pixels").unwrap();
                }
            }
            Behavior::Unreported(files) => {
                for file in files {
                    let path = self.output_dir.join(file);
                    std::fs::write(&path, b"rendered pixels").unwrap();
                    // Coarse filesystem clocks can stamp a fresh file before
                    // the job's receipt time; keep it clearly newer.
                    let handle = std::fs::File::options().write(true).open(&path).unwrap();
                    handle
                        .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(5))
                        .unwrap();
                }
            }
            _ => {}
        }

        Ok(SubmitResponse {
            prompt_id: Some(format!("prompt-{n}")),
            number: i64::from(n),
            node_errors: json!({}),
        })
    }

    async fn prompt_history(&self, _prompt_id: &str) -> Result<Option<PromptHistory>, ComfyUIApiError> {
        Ok(Some(serde_json::from_value(self.history()).unwrap()))
    }

    async fn refresh_models(&self) -> Result<(), ComfyUIApiError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake launcher
// ---------------------------------------------------------------------------

/// Counts launches; optionally makes the engine healthy when launched.
pub struct FakeLauncher {
    engine: Arc<FakeEngine>,
    starts_engine: bool,
    pub launches: Arc<AtomicU32>,
}

impl FakeLauncher {
    pub fn new(engine: Arc<FakeEngine>, starts_engine: bool) -> Self {
        Self {
            engine,
            starts_engine,
            launches: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&mut self) -> std::io::Result<Option<u32>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.starts_engine {
            self.engine.healthy.store(true, Ordering::SeqCst);
        }
        Ok(Some(1234))
    }

    fn exit_status(&mut self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Worker fixture
// ---------------------------------------------------------------------------

/// Temporary engine install, output directory and volume.
pub struct Workspace {
    pub tmp: tempfile::TempDir,
    pub output_dir: PathBuf,
    pub volume_root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let output_dir = tmp.path().join("ComfyUI/output");
        std::fs::create_dir_all(&output_dir).unwrap();
        let volume_root = tmp.path().join("volume");
        Self {
            tmp,
            output_dir,
            volume_root,
        }
    }

    /// Replace the volume with a regular file so it can never be written.
    pub fn break_volume(&self) {
        std::fs::write(&self.volume_root, b"not a mount").unwrap();
    }

    pub fn config(&self, extra: &[(&str, &str)]) -> Arc<WorkerConfig> {
        let mut vars: HashMap<String, String> = HashMap::new();
        let base = [
            ("COMFYUI_PATH", self.tmp.path().join("ComfyUI").display().to_string()),
            ("COMFYUI_OUTPUT_PATH", self.output_dir.display().to_string()),
            ("COMFYUI_LOGS_PATH", self.tmp.path().join("logs").display().to_string()),
            ("VOLUME_PATH", self.volume_root.display().to_string()),
            ("LINK_VOLUME_MODELS", "false".to_string()),
            ("STARTUP_TIMEOUT_SECS", "30".to_string()),
            ("HEALTH_CHECK_INTERVAL_SECS", "1".to_string()),
            ("EXECUTION_TIMEOUT_SECS", "10".to_string()),
            ("POLL_INTERVAL_SECS", "1".to_string()),
        ];
        for (k, v) in base {
            vars.insert(k.to_string(), v);
        }
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        Arc::new(WorkerConfig::from_lookup(|key| vars.get(key).cloned()).unwrap())
    }
}

pub fn handler(
    config: Arc<WorkerConfig>,
    engine: &Arc<FakeEngine>,
    launcher: FakeLauncher,
    store: Option<Arc<dyn ObjectStore>>,
) -> JobHandler {
    JobHandler::new(config, engine.clone(), Box::new(launcher), store)
}

pub fn txt2img() -> Value {
    json!({
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sdxl.safetensors"}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["4", 0], "filename_prefix": "kiln"}}
    })
}

/// Run one invocation and return the serialized outcome.
pub async fn invoke(handler: &mut JobHandler, event: Value) -> Value {
    let request: RunRequest = serde_json::from_value(event).unwrap();
    serde_json::to_value(handler.handle(request).await).unwrap()
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Build the application router with the same middleware `main.rs` installs.
pub fn build_test_app(handler: JobHandler) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");
    Router::new()
        .merge(routes::router())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(AppState::new(handler))
}

pub async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_raw(app: Router, uri: &str, body: &str) -> Response {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response {
    post_raw(app, uri, &body.to_string()).await
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
