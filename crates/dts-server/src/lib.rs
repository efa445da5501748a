//! dts-server: the job registry, scheduler and execution tracker over REST.
//!
//! Provides:
//! - `/v1/jobs`, `/v1/scheduled-runs`, `/v1/executions` backed by SQLite
//! - Bearer token authentication on every `/v1` route
//! - HTTP health check endpoint
//! - A fire loop that starts due scheduled runs

pub mod fire_loop;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use dts_client::local::LocalBackend;
use dts_client::wire::ErrorBody;
use dts_config::DtsConfig;
use dts_storage::DtsStorage;

use handlers::*;

/// Shared server state.
pub struct ServerState {
    pub backend: LocalBackend,
    pub auth_token: Option<String>,
}

impl ServerState {
    pub fn new(storage: Arc<DtsStorage>, auth_token: Option<String>) -> Self {
        Self {
            backend: LocalBackend::new(storage),
            auth_token,
        }
    }
}

/// Build the router. `/health` is always open; `/v1` requires the bearer
/// token when one is configured.
pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/v1/jobs", get(list_jobs).post(create_job))
        .route(
            "/v1/jobs/{id}",
            get(get_job).put(update_job).delete(delete_job),
        )
        .route("/v1/jobs/{id}/cancel", post(cancel_job))
        .route(
            "/v1/scheduled-runs",
            get(list_scheduled_runs).post(create_scheduled_run),
        )
        .route("/v1/scheduled-runs/run-now", post(run_now))
        .route(
            "/v1/scheduled-runs/{id}",
            get(get_scheduled_run).delete(cancel_scheduled_run),
        )
        .route("/v1/executions", get(list_executions))
        .route("/v1/executions/{id}", get(get_execution))
        .route("/v1/executions/{id}/finish", post(finish_execution))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
}

/// Start the server.
///
/// Opens the database, spawns the fire loop, binds to the configured
/// address and serves until Ctrl-C.
pub async fn start_server(config: DtsConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.server.port);
    let host = config.server.host.clone();

    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let storage = Arc::new(
        DtsStorage::open(&db_path, config.server.capacity)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );

    let interval = Duration::from_secs(config.server.fire_interval_secs);
    tokio::spawn(fire_loop::run_fire_loop(storage.clone(), interval));

    let state = Arc::new(ServerState::new(storage, config.server.auth_token.clone()));
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Server listening on {addr}");
    info!("  API:    http://{addr}/v1");
    info!("  Health: http://{addr}/health");
    if state.auth_token.is_some() {
        info!("  Auth:   bearer token required");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

/// Serve on an already bound listener, without a fire loop.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

async fn require_bearer(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected_token) = &state.auth_token {
        match extract_bearer_token(request.headers()) {
            Some(token) if token == expected_token => {}
            _ => {
                tracing::warn!(path = %request.uri().path(), "API authentication failed");
                let body = ErrorBody {
                    kind: "unauthorized".into(),
                    message: "missing or invalid bearer token".into(),
                    from: None,
                    to: None,
                };
                return (axum::http::StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
            }
        }
    }
    next.run(request).await
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
