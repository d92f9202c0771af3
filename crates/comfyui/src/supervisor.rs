//! Engine process supervision.
//!
//! [`ProcessSupervisor`] owns the engine's readiness state for the whole
//! lifetime of the worker process. It is created once at startup and
//! lives until the container is torn down; nothing else mutates the
//! readiness state. A warm container therefore observes
//! [`ReadinessState::Ready`] on its next invocation and skips the launch.
//!
//! ```text
//! NOT_STARTED ──launch──> STARTING ──healthy──> READY
//!                             │                   │ probe fails
//!                             └──timeout──> CRASHED <─┘
//!                                              │ one restart per invocation
//!                                              └──> STARTING
//! ```
//!
//! Other components observe the state through [`ProcessSupervisor::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::engine::Engine;
use crate::launcher::Launcher;

/// Default time allowed for the engine to become healthy (heavy model
/// loading can take many minutes).
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default interval between health probes while starting.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Log a "still waiting" line every this many probes.
const PROGRESS_LOG_EVERY: u32 = 5;

/// Lifecycle of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadinessState {
    NotStarted,
    Starting,
    Ready,
    Crashed,
}

/// Snapshot of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub state: ReadinessState,
    /// When the current (or last) launch began.
    pub started_at: Option<Timestamp>,
}

/// Errors from bringing the engine to READY.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The process could not be spawned at all.
    #[error("Failed to launch engine: {0}")]
    Launch(#[from] std::io::Error),

    /// The process exited while we were waiting for it.
    #[error("Engine exited during startup ({status})")]
    Exited { status: String },

    /// The health endpoint never answered within the budget.
    #[error("Engine not healthy after {}s", waited.as_secs())]
    Timeout { waited: Duration },
}

/// Starts, health-checks and reuses the engine subprocess.
pub struct ProcessSupervisor {
    engine: Arc<dyn Engine>,
    launcher: Box<dyn Launcher>,
    health_interval: Duration,
    handle: watch::Sender<ProcessHandle>,
}

impl ProcessSupervisor {
    pub fn new(engine: Arc<dyn Engine>, launcher: Box<dyn Launcher>, health_interval: Duration) -> Self {
        let (handle, _) = watch::channel(ProcessHandle {
            state: ReadinessState::NotStarted,
            started_at: None,
        });

        Self {
            engine,
            launcher,
            health_interval,
            handle,
        }
    }

    /// Current readiness state.
    pub fn state(&self) -> ReadinessState {
        self.handle.borrow().state
    }

    /// Current process snapshot.
    pub fn handle(&self) -> ProcessHandle {
        self.handle.borrow().clone()
    }

    /// Observe readiness changes without holding the supervisor.
    pub fn subscribe(&self) -> watch::Receiver<ProcessHandle> {
        self.handle.subscribe()
    }

    /// Make sure the engine is READY, starting it if needed.
    ///
    /// * READY: probe once; healthy returns immediately (warm path),
    ///   otherwise the process is considered crashed and restarted once.
    /// * NOT_STARTED: adopt an engine that is already answering, else launch.
    /// * STARTING (an earlier call was cancelled mid-start) or CRASHED:
    ///   adopt the engine if it answers now, else one restart.
    ///
    /// At most one launch happens per call. A failed launch leaves the
    /// state CRASHED.
    pub async fn ensure_ready(&mut self, startup_timeout: Duration) -> Result<(), SupervisorError> {
        match self.state() {
            ReadinessState::Ready => {
                if self.engine.is_healthy().await {
                    tracing::debug!("Engine already running (warm start)");
                    return Ok(());
                }
                tracing::warn!("Engine failed its pre-submission health probe, restarting once");
                self.set_state(ReadinessState::Crashed);
            }
            ReadinessState::NotStarted => {
                if self.engine.is_healthy().await {
                    tracing::info!("Engine already answering, adopting it without launching");
                    self.mark_started();
                    self.set_state(ReadinessState::Ready);
                    return Ok(());
                }
            }
            previous @ (ReadinessState::Crashed | ReadinessState::Starting) => {
                if self.engine.is_healthy().await {
                    tracing::info!(?previous, "Engine answering again, adopting it without relaunching");
                    self.set_state(ReadinessState::Ready);
                    return Ok(());
                }
                tracing::warn!(?previous, "Engine not answering, attempting a restart");
            }
        }

        self.start(startup_timeout).await
    }

    /// Launch the engine and wait for it to become healthy.
    async fn start(&mut self, startup_timeout: Duration) -> Result<(), SupervisorError> {
        self.mark_started();
        self.set_state(ReadinessState::Starting);

        if let Err(e) = self.launcher.launch().await {
            tracing::error!(error = %e, "Failed to spawn engine process");
            self.set_state(ReadinessState::Crashed);
            return Err(SupervisorError::Launch(e));
        }

        match self.wait_until_healthy(startup_timeout).await {
            Ok(()) => {
                self.set_state(ReadinessState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to start");
                if let Some(tail) = self.launcher.diagnostics().await {
                    tracing::error!(stderr_tail = %tail, "Last engine stderr lines");
                }
                self.set_state(ReadinessState::Crashed);
                Err(e)
            }
        }
    }

    /// Probe the health endpoint at a fixed interval until it answers,
    /// the process exits, or `timeout` elapses.
    async fn wait_until_healthy(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut probes = 0u32;

        tracing::info!(timeout_secs = timeout.as_secs(), "Waiting for engine to become healthy");

        loop {
            if self.engine.is_healthy().await {
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Engine is healthy",
                );
                return Ok(());
            }

            if let Some(status) = self.launcher.exit_status() {
                return Err(SupervisorError::Exited { status });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::Timeout {
                    waited: now - started,
                });
            }

            probes += 1;
            if probes % PROGRESS_LOG_EVERY == 0 {
                tracing::info!(
                    elapsed_secs = (now - started).as_secs(),
                    timeout_secs = timeout.as_secs(),
                    "Still waiting for engine",
                );
            }

            tokio::time::sleep(self.health_interval.min(deadline - now)).await;
        }
    }

    fn set_state(&self, state: ReadinessState) {
        self.handle.send_modify(|h| h.state = state);
        tracing::debug!(?state, "Engine readiness changed");
    }

    fn mark_started(&self) {
        self.handle.send_modify(|h| h.started_at = Some(Utc::now()));
    }
}
