use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use clap::Parser;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{AboutResponse, ConnectionInfo, UpdateConnectionRequest, API_ROUTE_PREFIX},
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use api::ApiContext;
use config::load_settings;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

/// Local backend for the Durable Functions monitor.
#[derive(Debug, Parser)]
#[command(name = "monitor-backend")]
struct Cli {
    /// Port to listen on, overriding the configured bind address port.
    #[arg(long)]
    port: Option<u16>,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings();
    let addr = settings.socket_addr(cli.port)?;

    if settings.nonce.is_none() {
        warn!("DFM_NONCE is not set; every api call will be rejected");
    }

    let state = AppState {
        api: ApiContext::from(&settings),
    };
    let app = build_router(Arc::new(state));

    info!(%addr, hub = %settings.hub_name, "monitor backend listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(&format!("{API_ROUTE_PREFIX}/about"), get(http_about))
        .route(
            &format!("{API_ROUTE_PREFIX}/manage-connection"),
            get(http_get_connection).put(http_put_connection),
        )
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_about(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<AboutResponse>> {
    api::validate_nonce(&state.api, &headers).map_err(error_response)?;
    Ok(Json(api::about(&state.api)))
}

async fn http_get_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<ConnectionInfo>> {
    api::validate_nonce(&state.api, &headers).map_err(error_response)?;
    Ok(Json(api::connection_info(&state.api).await))
}

async fn http_put_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    api::validate_nonce(&state.api, &headers).map_err(error_response)?;

    let request: UpdateConnectionRequest = serde_json::from_slice(&body).map_err(|e| {
        error_response(ApiError::new(
            ErrorCode::Validation,
            format!("invalid request body: {e}"),
        ))
    })?;

    api::update_connection(&state.api, request)
        .await
        .map_err(error_response)?;
    info!("connection settings updated in local.settings.json");
    Ok(StatusCode::OK)
}

fn error_response(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(message = %error.message, "api call failed");
    }
    (status, Json(error))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
