mod admin;
mod config;
mod error;
mod forward;
mod masking;
mod routing;
mod runtime;
mod store;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::SystemConfig;
use crate::routing::match_route;
use crate::runtime::RuntimeState;
use crate::store::resolve_config_path;

fn main() -> anyhow::Result<()> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config_path = resolve_config_path(env::var("SPG_CONFIG_PATH").ok().map(PathBuf::from));
    let config = store::load_config(&config_path)
        .with_context(|| format!("failed to load config at {}", config_path.display()))?;
    let (_, format) = store::read_raw_config(&config_path)?;

    let host = config.server.host.clone();
    let port = config.server.port;

    let state = Arc::new(RuntimeState::new(config_path.clone(), config, format));

    let app = Router::new()
        .merge(admin::router())
        .fallback(any(proxy_entry))
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(config = %config_path.display(), listen = %addr, "gateway is starting");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server stopped unexpectedly")?;

    Ok(())
}

async fn proxy_entry(
    State(state): State<Arc<RuntimeState>>,
    ConnectInfo(_peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.maybe_reload().await;

    let config: Arc<SystemConfig> = state.config.load_full();
    let (route, has_path_match) = match_route(uri.path(), method.as_str(), &config.routes);

    if !has_path_match {
        return error_response(StatusCode::NOT_FOUND, "Route Not Found", uri.path(), &headers);
    }
    let Some(route) = route else {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed", uri.path(), &headers);
    };

    forward::forward_request(state.clone(), route, method, uri, headers, body).await
}

fn error_response(status: StatusCode, message: &str, path: &str, headers: &HeaderMap) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

    let mut response = (status, Json(json!({"error": message, "path": path, "request_id": request_id}))).into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .init();
}
