use std::sync::Arc;

use kiln_comfyui::supervisor::ProcessHandle;
use tokio::sync::{watch, Mutex};

use crate::handler::JobHandler;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// The single job handler. The lock serializes invocations so at most
    /// one job runs per process.
    pub handler: Arc<Mutex<JobHandler>>,
    /// Engine readiness, readable while a job holds the handler.
    pub engine_state: watch::Receiver<ProcessHandle>,
}

impl AppState {
    pub fn new(handler: JobHandler) -> Self {
        let engine_state = handler.engine_state();
        Self {
            handler: Arc::new(Mutex::new(handler)),
            engine_state,
        }
    }
}
