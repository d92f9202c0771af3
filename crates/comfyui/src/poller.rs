//! Completion polling.
//!
//! The poller is a small state machine driven one tick at a time:
//!
//! ```text
//! Pending ──history says success/error──> Terminal
//!    │ └──fetch failed (<= max errors)──> Pending
//!    └────deadline reached / too many errors──> Terminal(TIMEOUT)
//! ```
//!
//! It only suspends between ticks. The deadline is passed in by the
//! caller so tests can run against a paused clock. The engine process is
//! never touched on timeout; the computation may keep running.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::engine::Engine;
use crate::history::{HistoryState, NodeFailure, OutputRef};

/// Default interval between history requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default execution budget.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default number of consecutive failed fetches tolerated.
pub const DEFAULT_MAX_POLL_ERRORS: u32 = 5;

/// Default limit on a single history request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Log progress roughly this often.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    /// Consecutive fetch failures tolerated before giving up.
    pub max_consecutive_errors: u32,
    /// Upper bound on one history request. The deadline caps it further.
    pub request_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_consecutive_errors: DEFAULT_MAX_POLL_ERRORS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Success,
    ExecutionError,
    Timeout,
}

/// Terminal outcome of a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub status: CompletionStatus,
    /// Output references in engine order; empty unless `Success`.
    pub outputs: Vec<OutputRef>,
    pub diagnostic: Option<String>,
    /// The failing node for `ExecutionError`.
    pub failed_node: Option<NodeFailure>,
    pub elapsed: Duration,
}

impl CompletionResult {
    fn success(outputs: Vec<OutputRef>, elapsed: Duration) -> Self {
        Self {
            status: CompletionStatus::Success,
            outputs,
            diagnostic: None,
            failed_node: None,
            elapsed,
        }
    }

    fn execution_error(failure: NodeFailure, elapsed: Duration) -> Self {
        Self {
            status: CompletionStatus::ExecutionError,
            outputs: Vec::new(),
            diagnostic: Some(failure.to_string()),
            failed_node: Some(failure),
            elapsed,
        }
    }

    fn timeout(diagnostic: String, elapsed: Duration) -> Self {
        Self {
            status: CompletionStatus::Timeout,
            outputs: Vec::new(),
            diagnostic: Some(diagnostic),
            failed_node: None,
            elapsed,
        }
    }
}

/// Poller state between ticks.
#[derive(Debug)]
enum PollState {
    Pending { polls: u32, consecutive_errors: u32 },
    Terminal(CompletionResult),
}

pub struct CompletionPoller {
    engine: Arc<dyn Engine>,
    config: PollConfig,
}

impl CompletionPoller {
    pub fn new(engine: Arc<dyn Engine>, config: PollConfig) -> Self {
        Self { engine, config }
    }

    /// Poll `prompt_id` until it reaches a terminal state or `deadline`.
    ///
    /// At timeout the reported elapsed time lies in
    /// `[deadline - start, deadline - start + interval)`.
    pub async fn wait_for_completion(&self, prompt_id: &str, deadline: Instant) -> CompletionResult {
        let started = Instant::now();
        let mut last_progress = started;
        let mut state = PollState::Pending {
            polls: 0,
            consecutive_errors: 0,
        };

        loop {
            state = match state {
                PollState::Terminal(result) => {
                    log_outcome(prompt_id, &result);
                    return result;
                }
                PollState::Pending {
                    polls,
                    consecutive_errors,
                } => {
                    let now = Instant::now();
                    if now >= deadline {
                        PollState::Terminal(CompletionResult::timeout(
                            format!(
                                "no terminal status after {}s ({polls} polls)",
                                (now - started).as_secs()
                            ),
                            now - started,
                        ))
                    } else {
                        if now - last_progress >= PROGRESS_LOG_INTERVAL {
                            last_progress = now;
                            tracing::info!(
                                prompt_id,
                                elapsed_secs = (now - started).as_secs(),
                                remaining_secs = (deadline - now).as_secs(),
                                polls,
                                "Waiting for job completion",
                            );
                        }
                        self.tick(prompt_id, polls, consecutive_errors, started, deadline).await
                    }
                }
            };
        }
    }

    /// One history request, then sleep until the next tick if still pending.
    async fn tick(
        &self,
        prompt_id: &str,
        polls: u32,
        consecutive_errors: u32,
        started: Instant,
        deadline: Instant,
    ) -> PollState {
        // A request never outlives the deadline, so the timeout is still
        // reported within one interval of it.
        let request_deadline = deadline.min(Instant::now() + self.config.request_timeout);
        let fetched = tokio::time::timeout_at(request_deadline, self.engine.prompt_history(prompt_id)).await;

        let error = match fetched {
            Ok(Ok(Some(history))) => match history.state() {
                HistoryState::Running => None,
                HistoryState::Succeeded(outputs) => {
                    return PollState::Terminal(CompletionResult::success(outputs, started.elapsed()));
                }
                HistoryState::Failed(failure) => {
                    return PollState::Terminal(CompletionResult::execution_error(failure, started.elapsed()));
                }
            },
            Ok(Ok(None)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("history request timed out".to_string()),
        };

        let consecutive_errors = match error {
            None => 0,
            Some(reason) => {
                let count = consecutive_errors + 1;
                tracing::warn!(
                    prompt_id,
                    error = %reason,
                    consecutive_errors = count,
                    max = self.config.max_consecutive_errors,
                    "History poll failed",
                );
                if count > self.config.max_consecutive_errors {
                    return PollState::Terminal(CompletionResult::timeout(
                        format!("gave up after {count} consecutive poll failures: {reason}"),
                        started.elapsed(),
                    ));
                }
                count
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(self.config.interval.min(remaining)).await;

        PollState::Pending {
            polls: polls + 1,
            consecutive_errors,
        }
    }
}

fn log_outcome(prompt_id: &str, result: &CompletionResult) {
    let elapsed_ms = result.elapsed.as_millis() as u64;
    match result.status {
        CompletionStatus::Success => tracing::info!(
            prompt_id,
            elapsed_ms,
            outputs = result.outputs.len(),
            "Job completed",
        ),
        CompletionStatus::ExecutionError => tracing::error!(
            prompt_id,
            elapsed_ms,
            diagnostic = result.diagnostic.as_deref().unwrap_or_default(),
            "Job failed in the engine",
        ),
        CompletionStatus::Timeout => tracing::error!(
            prompt_id,
            elapsed_ms,
            diagnostic = result.diagnostic.as_deref().unwrap_or_default(),
            "Job timed out; engine left running",
        ),
    }
}
