//! Job orchestration.
//!
//! One [`JobHandler`] lives for the whole worker process and handles
//! invocations strictly one at a time:
//!
//! 1. validate the request (before the engine is touched),
//! 2. link volume models and bring the engine to READY,
//! 3. submit the workflow and poll it to a terminal state,
//! 4. collect the produced files and dispatch them to storage.
//!
//! Every failure is folded into a [`JobOutcome::Failure`]; nothing is
//! propagated raw to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_cloud::dispatcher::{StorageDispatcher, StorageResult, UploadWarnings};
use kiln_cloud::store::ObjectStore;
use kiln_cloud::volume::VolumeTarget;
use kiln_comfyui::engine::Engine;
use kiln_comfyui::launcher::Launcher;
use kiln_comfyui::poller::{CompletionPoller, CompletionStatus};
use kiln_comfyui::submitter::{validate_workflow, JobSubmitter};
use kiln_comfyui::supervisor::{ProcessHandle, ProcessSupervisor};
use kiln_core::naming::sanitize_job_id;
use kiln_core::types::{Timestamp, WorkflowGraph};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::collector::{remove_outputs, ArtifactCollector};
use crate::config::WorkerConfig;
use crate::error::{JobError, Stage};
use crate::models::{link_volume_models, LinkOutcome};

/// Event type that only checks the worker is alive.
const HEARTBEAT_EVENT: &str = "heartbeat";

/// Inbound invocation: `{ id?, type?, input: { workflow } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

/// One invocation's job, created on receipt and dropped with the response.
#[derive(Debug, Clone)]
pub struct Job {
    pub external_id: Option<String>,
    /// Filesystem-safe id used for every artifact name.
    pub sanitized_id: String,
    pub workflow: WorkflowGraph,
    pub received_at: Timestamp,
    /// Budget from submission to a terminal state; the poll deadline is
    /// derived from it once the engine has accepted the workflow.
    pub execution_budget: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSuccess {
    pub links: Vec<String>,
    pub total_images: usize,
    pub job_id: String,
    pub storage_type: &'static str,
    pub local_paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volume_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<UploadWarnings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub error: String,
    pub error_kind: &'static str,
    pub stage: Stage,
    pub job_id: Option<String>,
}

/// Structured result of one invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobOutcome {
    Heartbeat { status: &'static str },
    Success(JobSuccess),
    Failure(JobFailure),
}

impl JobOutcome {
    fn failure(err: &JobError, job_id: Option<String>) -> Self {
        JobOutcome::Failure(JobFailure {
            error: err.to_string(),
            error_kind: err.kind(),
            stage: err.stage(),
            job_id,
        })
    }
}

pub struct JobHandler {
    config: Arc<WorkerConfig>,
    engine: Arc<dyn Engine>,
    supervisor: ProcessSupervisor,
    submitter: JobSubmitter,
    poller: CompletionPoller,
    collector: ArtifactCollector,
    store: Option<Arc<dyn ObjectStore>>,
    volume: VolumeTarget,
}

impl JobHandler {
    pub fn new(
        config: Arc<WorkerConfig>,
        engine: Arc<dyn Engine>,
        launcher: Box<dyn Launcher>,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(Arc::clone(&engine), launcher, config.timeouts.health_interval);

        Self {
            submitter: JobSubmitter::new(Arc::clone(&engine)),
            poller: CompletionPoller::new(Arc::clone(&engine), config.timeouts.poll()),
            collector: ArtifactCollector::new(&config.engine.output_dir),
            volume: config.storage.volume(),
            supervisor,
            engine,
            store,
            config,
        }
    }

    /// Engine readiness, observable without locking the handler.
    pub fn engine_state(&self) -> watch::Receiver<ProcessHandle> {
        self.supervisor.subscribe()
    }

    /// Handle one invocation. Never fails; errors become a failure outcome.
    pub async fn handle(&mut self, request: RunRequest) -> JobOutcome {
        if request.kind.as_deref() == Some(HEARTBEAT_EVENT) {
            tracing::debug!("Heartbeat");
            return JobOutcome::Heartbeat { status: "ok" };
        }

        let job = match self.accept(request) {
            Ok(job) => job,
            Err((err, job_id)) => {
                tracing::warn!(job_id = job_id.as_deref().unwrap_or("-"), error = %err, "Rejected invocation");
                return JobOutcome::failure(&err, job_id);
            }
        };

        let started = std::time::Instant::now();
        tracing::info!(job_id = %job.sanitized_id, external_id = ?job.external_id, "Job received");

        match self.run(&job).await {
            Ok(success) => {
                tracing::info!(
                    job_id = %job.sanitized_id,
                    artifacts = success.total_images,
                    storage_type = success.storage_type,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job succeeded",
                );
                JobOutcome::Success(success)
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.sanitized_id,
                    kind = err.kind(),
                    stage = ?err.stage(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Job failed",
                );
                JobOutcome::failure(&err, Some(job.sanitized_id))
            }
        }
    }

    /// Build the job from the request, validating the workflow first.
    fn accept(&self, request: RunRequest) -> Result<Job, (JobError, Option<String>)> {
        let sanitized_id = sanitize_job_id(request.id.as_deref()).unwrap_or_else(|| {
            let generated = uuid::Uuid::new_v4().to_string();
            tracing::debug!(generated = %generated, "No usable job id supplied, generated one");
            generated
        });

        let workflow = request.input.as_ref().and_then(|input| input.get("workflow"));
        let workflow = match validate_workflow(workflow) {
            Ok(_) => workflow.cloned().unwrap_or_default(),
            Err(e) => return Err((JobError::from(e), Some(sanitized_id))),
        };

        Ok(Job {
            external_id: request.id,
            sanitized_id,
            workflow,
            received_at: Utc::now(),
            execution_budget: self.config.timeouts.execution,
        })
    }

    async fn run(&mut self, job: &Job) -> Result<JobSuccess, JobError> {
        let job_id = job.sanitized_id.as_str();

        let linked = self.prepare_models().await;
        self.supervisor.ensure_ready(self.config.timeouts.startup).await?;
        if linked && self.config.engine.refresh_models {
            self.refresh_models().await;
        }

        let submission = self.submitter.submit(&job.workflow, job_id).await?;

        let deadline = Instant::now() + job.execution_budget;
        let result = self.poller.wait_for_completion(&submission.prompt_id, deadline).await;

        match result.status {
            CompletionStatus::Success => {}
            CompletionStatus::ExecutionError => {
                return Err(JobError::Execution {
                    node_id: result.failed_node.as_ref().and_then(|n| n.node_id.clone()),
                    message: result.diagnostic.clone().unwrap_or_default(),
                });
            }
            CompletionStatus::Timeout => {
                return Err(JobError::Timeout {
                    elapsed: result.elapsed,
                    diagnostic: result.diagnostic.clone().unwrap_or_default(),
                });
            }
        }

        let artifacts = self.collector.collect(&result, job.received_at).await?;

        let dispatcher = StorageDispatcher::prepare(self.store.clone(), &self.volume).await;
        let stored = dispatcher.dispatch(&artifacts, job_id).await?;

        if self.config.cleanup_temp_files {
            if stored.fully_delivered {
                remove_outputs(&artifacts).await;
            } else {
                tracing::warn!(job_id, "Keeping engine outputs, not every artifact was delivered");
            }
        }

        Ok(success(job_id, stored))
    }

    /// Link volume models when enabled. Returns whether a new link was made.
    async fn prepare_models(&self) -> bool {
        if !self.config.storage.link_volume_models {
            return false;
        }

        match link_volume_models(&self.config.engine.install_dir, &self.config.storage.volume_root).await {
            Ok(LinkOutcome::Linked(_)) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Could not link volume models");
                false
            }
        }
    }

    async fn refresh_models(&self) {
        match self.engine.refresh_models().await {
            Ok(()) => {
                let checkpoints = self.engine.checkpoint_names().await.unwrap_or_default();
                tracing::info!(checkpoints = checkpoints.len(), "Engine model list refreshed");
            }
            Err(e) => tracing::warn!(error = %e, "Model refresh failed"),
        }
    }
}

fn success(job_id: &str, stored: StorageResult) -> JobSuccess {
    JobSuccess {
        total_images: stored.links.len(),
        job_id: job_id.to_string(),
        storage_type: stored.mode.storage_type().unwrap_or("none"),
        links: stored.links,
        local_paths: stored.local_paths,
        volume_paths: stored.volume_paths,
        s3_bucket: stored.bucket,
        warnings: stored.warnings,
    }
}
