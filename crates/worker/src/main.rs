use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderName;
use axum::Router;
use kiln_cloud::s3::S3Store;
use kiln_cloud::store::ObjectStore;
use kiln_comfyui::api::ComfyUIApi;
use kiln_comfyui::launcher::CommandLauncher;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_worker::config::WorkerConfig;
use kiln_worker::handler::JobHandler;
use kiln_worker::routes;
use kiln_worker::state::AppState;

const DEFAULT_LOG_FILTER: &str = "kiln_worker=info,kiln_comfyui=info,kiln_cloud=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = Arc::new(WorkerConfig::from_env().context("Invalid worker configuration")?);
    tracing::info!(
        engine = %config.engine.api_url(),
        install_dir = %config.engine.install_dir.display(),
        output_dir = %config.engine.output_dir.display(),
        s3 = config.storage.s3.is_some(),
        volume = %config.storage.volume().output_dir().display(),
        "Loaded worker configuration",
    );

    // --- Engine ---
    let engine = Arc::new(
        ComfyUIApi::new(config.engine.api_url(), config.timeouts.http)
            .context("Failed to build engine HTTP client")?,
    );
    let launcher = Box::new(CommandLauncher::new(config.engine.command()));

    // --- Object storage ---
    let store: Option<Arc<dyn ObjectStore>> = match &config.storage.s3 {
        Some(s3) => Some(Arc::new(S3Store::connect(s3).await)),
        None => {
            tracing::info!("Object storage not configured, artifacts go to the volume only");
            None
        }
    };

    // --- App state ---
    let handler = JobHandler::new(Arc::clone(&config), engine, launcher, store);
    let state = AppState::new(handler);

    // --- Router ---
    let request_id_header = HeaderName::from_static("x-request-id");
    let app = Router::new()
        .merge(routes::router())
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state);

    // --- Start server ---
    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("Invalid WORKER_HOST '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting worker");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The engine subprocess stays running; container
    // teardown reaps it.
    tracing::info!("Worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
