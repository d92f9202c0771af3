use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};

use crate::handler::{JobOutcome, RunRequest};
use crate::state::AppState;

/// POST /run -- execute one job and return its structured outcome.
///
/// Job failures are part of the outcome body, so this always answers
/// 200 once the request body parses. Concurrent calls queue on the
/// handler lock.
///
/// The job runs in its own task holding the lock, so a client that
/// disconnects does not cancel it halfway through an engine start.
async fn run_job(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Response {
    let mut handler = state.handler.lock_owned().await;
    let job = tokio::spawn(async move { handler.handle(request).await });

    match job.await {
        Ok(outcome) => Json::<JobOutcome>(outcome).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Job task did not complete");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "job task did not complete"})),
            )
                .into_response()
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/run", post(run_job))
}
