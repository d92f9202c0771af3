pub mod health;
pub mod run;

use axum::Router;

use crate::state::AppState;

/// All worker routes, mounted at the root.
pub fn router() -> Router<AppState> {
    Router::new().merge(health::router()).merge(run::router())
}
