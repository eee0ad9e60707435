use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use paged_serving::{
    GenerateParameters, LlmService, LlmServiceError, SchedulerSnapshot,
};
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use executor::SyntheticExecutor;
use stream::Streamer;

pub mod executor;
pub mod stream;
#[cfg(test)]
pub mod tests;

/// The URL path to POST JSON for token generation.
pub const GENERATE_PATH: &str = "/generate";
/// The URL path to GET the latest scheduler snapshot.
pub const SNAPSHOT_PATH: &str = "/snapshot";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the configuration file, with `[cache]`, `[scheduler]` and `[service]` tables
    #[arg(short, long)]
    config_path: PathBuf,
    /// Address the HTTP server listens on
    #[arg(long, default_value = "0.0.0.0:8080")]
    address: SocketAddr,
    /// Address the Prometheus exporter listens on
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_address: SocketAddr,
    /// Seed of the synthetic engine
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Vocabulary size of the synthetic engine
    #[arg(long, default_value_t = 32_000, value_parser = clap::value_parser!(u32).range(1..))]
    vocab_size: u32,
    /// End of sequence token id of the synthetic engine
    #[arg(long, default_value_t = 2)]
    eos_token_id: u32,
    /// Probability that the synthetic engine samples the end of sequence token
    #[arg(long, default_value_t = 0.01)]
    eos_probability: f64,
    /// Time the synthetic engine spends on each batch, in milliseconds
    #[arg(long, default_value_t = 10)]
    step_delay_ms: u64,
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<LlmService>,
}

/// Body of a generation request
#[derive(Debug, Deserialize)]
pub struct GenerateRequestBody {
    /// Tokenized prompt
    pub prompt_token_ids: Vec<u32>,
    /// Generation parameters
    #[serde(default)]
    pub parameters: GenerateParameters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Args::parse();

    PrometheusBuilder::new()
        .with_http_listener(cli.metrics_address)
        .install()?;

    let executor = SyntheticExecutor::new(
        cli.seed,
        cli.vocab_size,
        cli.eos_token_id,
        cli.eos_probability,
        Duration::from_millis(cli.step_delay_ms),
    );
    let service = LlmService::start_from_file_path(&cli.config_path, executor)
        .map_err(|e| anyhow::anyhow!("Failed to start `LlmService`, with error: {e}"))?;

    let listener = TcpListener::bind(cli.address).await?;
    let app_state = AppState {
        service: Arc::new(service),
    };
    run_server(listener, app_state).await
}

/// Builds the HTTP router
pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route(GENERATE_PATH, post(generate_handler))
        .route("/requests/:request_id/cancel", post(cancel_handler))
        .route("/requests/:request_id/fork", post(fork_handler))
        .route(SNAPSHOT_PATH, get(snapshot_handler))
        .with_state(app_state)
}

/// Runs the Axum server and manages its lifecycle, including graceful shutdown.
///
/// # Flow
///
/// 1. Sets up the HTTP router.
/// 2. Serves requests until Ctrl+C is received.
/// 3. Shuts the `LlmService` down, following its configured shutdown policy,
///    with a timeout.
pub async fn run_server(listener: TcpListener, app_state: AppState) -> anyhow::Result<()> {
    let service = app_state.service.clone();
    let http_router = router(app_state);

    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C signal: {e}");
        }
        info!("Shutting down server...");
    };

    info!("Server running on {}, press Ctrl+C to shut it down", listener.local_addr()?);
    axum::serve(listener, http_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    let service = Arc::try_unwrap(service)
        .map_err(|_| anyhow::anyhow!("`LlmService` is still referenced after the server stopped"))?;
    match tokio::time::timeout(Duration::from_secs(30), service.shutdown()).await {
        Ok(Ok(())) => info!("LlmService shutdown successfully"),
        Ok(Err(e)) => error!("LlmService encountered an error during shutdown: {e}"),
        Err(_) => error!("LlmService shutdown timed out"),
    }
    info!("Server and LlmService shutdown complete");

    Ok(())
}

type HandlerError = (StatusCode, Json<serde_json::Value>);

fn handler_error(error: LlmServiceError, request_id: Option<&str>) -> HandlerError {
    let (status_code, error_type) = match &error {
        LlmServiceError::AdmissionRejected(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "admission_rejected")
        }
        LlmServiceError::ValidationError(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        LlmServiceError::CannotFork(_) => (StatusCode::CONFLICT, "cannot_fork"),
        LlmServiceError::EngineStopped => (StatusCode::SERVICE_UNAVAILABLE, "engine_stopped"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (
        status_code,
        Json(json!({
            "error": {
                "message": error.to_string(),
                "type": error_type,
                "request_id": request_id,
            }
        })),
    )
}

/// Submits a generation request and streams its tokens back as server sent
/// events: `tokens` events followed by a single `finished` event.
pub async fn generate_handler(
    State(app_state): State<AppState>,
    Json(request): Json<GenerateRequestBody>,
) -> Result<Sse<Streamer>, HandlerError> {
    let handle = app_state
        .service
        .new_request(request.prompt_token_ids, request.parameters)
        .map_err(|e| handler_error(e, None))?;
    Ok(Sse::new(Streamer::new(handle.request_id, handle.receiver)).keep_alive(KeepAlive::default()))
}

/// Cancels a request, cancelling an unknown or finished request is a no-op
pub async fn cancel_handler(
    State(app_state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<StatusCode, HandlerError> {
    app_state
        .service
        .cancel(&request_id)
        .map_err(|e| handler_error(e, Some(&request_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Forks a running request and streams the tokens of the new request
pub async fn fork_handler(
    State(app_state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Sse<Streamer>, HandlerError> {
    let handle = app_state
        .service
        .fork_request(&request_id)
        .await
        .map_err(|e| handler_error(e, Some(&request_id)))?;
    Ok(Sse::new(Streamer::new(handle.request_id, handle.receiver)).keep_alive(KeepAlive::default()))
}

/// Latest scheduler snapshot
pub async fn snapshot_handler(State(app_state): State<AppState>) -> Json<SchedulerSnapshot> {
    Json(app_state.service.snapshot())
}
