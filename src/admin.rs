//! Admin API: the loopback-restricted control surface for inspecting and
//! replacing the live config.
//!
//! Grounded in `original_source/.../web/routers.py` for the endpoint set
//! and the `_ensure_admin_access`/raw-content-with-format-hint save path,
//! and in `inteniquetic-prx/src/admin.rs` for the axum extractor/response
//! helper style (`bytes_response`/`json_response`/`text_response`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use serde::Serialize;
use serde_json::json;

use crate::config::SystemConfig;
use crate::error::{GatewayError, Result};
use crate::runtime::RuntimeState;
use crate::store::{self, ConfigFormat};

const UI_HTML: &str = include_str!("admin_ui.html");
const MINIMAL_HEADER: &str = "x-config-minimal";

/// A config update body is either the raw `{content, format?}` shape the
/// admin UI sends (preserving comments/layout on round-trip), or a bare
/// structured config object posted directly by older/external callers.
enum ConfigUpdateBody {
    Raw { content: String, format: Option<String> },
    Structured(serde_json::Value),
}

fn parse_update_body(body: &[u8]) -> std::result::Result<ConfigUpdateBody, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| format!("invalid JSON body: {err}"))?;
    if let Some(content) = value.get("content").and_then(|v| v.as_str()) {
        let format = value.get("format").and_then(|v| v.as_str()).map(str::to_string);
        Ok(ConfigUpdateBody::Raw { content: content.to_string(), format })
    } else {
        Ok(ConfigUpdateBody::Structured(value))
    }
}

fn config_from_structured(value: serde_json::Value) -> Result<SystemConfig> {
    let mut config: SystemConfig = serde_json::from_value(value)
        .map_err(|err| GatewayError::config(format!("config schema violation: {err}")))?;
    config.validate()?;
    Ok(config)
}

fn config_minimal_header(headers: &HeaderMap) -> bool {
    headers
        .get(MINIMAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[derive(Debug, Serialize)]
struct CurrentConfigPayload {
    config: serde_json::Value,
    raw: String,
    format: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct ValidateOkPayload {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    ok: bool,
    error: String,
}

fn text_response(status: StatusCode, content_type: &str, body: impl Into<String>) -> Response {
    let mut response = body.into().into_response();
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    response
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorPayload { ok: false, error: message.into() })).into_response()
}

/// Only the host named by `server.admin_host` may reach the admin surface.
/// A loopback client talking to a loopback-configured admin host is always
/// allowed, independent of exact string equality.
fn admin_access_allowed(peer: &SocketAddr, admin_host: &str) -> bool {
    let peer_ip = peer.ip();
    if peer_ip.to_string() == admin_host {
        return true;
    }
    peer_ip.is_loopback() && matches!(admin_host, "127.0.0.1" | "localhost" | "::1")
}

fn ensure_admin_access(peer: &SocketAddr, runtime: &RuntimeState) -> Result<(), Response> {
    let admin_host = runtime.config.load().server.admin_host.clone();
    if admin_access_allowed(peer, &admin_host) {
        Ok(())
    } else {
        Err(json_error(StatusCode::FORBIDDEN, GatewayError::AdminAccessDenied.to_string()))
    }
}

async fn get_ui(ConnectInfo(peer): ConnectInfo<SocketAddr>, State(runtime): State<Arc<RuntimeState>>) -> Response {
    if let Err(response) = ensure_admin_access(&peer, &runtime) {
        return response;
    }
    text_response(StatusCode::OK, "text/html; charset=utf-8", UI_HTML)
}

async fn get_config(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(runtime): State<Arc<RuntimeState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = ensure_admin_access(&peer, &runtime) {
        return response;
    }
    runtime.maybe_reload().await;

    let (raw, fmt) = match store::read_raw_config(&runtime.config_path) {
        Ok(result) => result,
        Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let config = runtime.config.load().to_json_value(config_minimal_header(&headers));
    Json(CurrentConfigPayload {
        config,
        raw,
        format: fmt.to_string(),
        path: runtime.config_path.display().to_string(),
    })
    .into_response()
}

async fn post_config(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(runtime): State<Arc<RuntimeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = ensure_admin_access(&peer, &runtime) {
        return response;
    }

    match parse_update_body(&body) {
        Ok(ConfigUpdateBody::Raw { content, format }) => {
            let fmt = format
                .as_deref()
                .and_then(ConfigFormat::parse)
                .unwrap_or_else(|| store::detect_format(&content));
            match store::save_config_raw(&content, fmt, &runtime.config_path) {
                Ok(config) => {
                    runtime.apply_config(config, Some(fmt));
                    Json(json!({"ok": true, "format": fmt.to_string()})).into_response()
                }
                Err(err) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
            }
        }
        Ok(ConfigUpdateBody::Structured(value)) => match config_from_structured(value) {
            Ok(config) => {
                let fmt = *runtime.config_format.lock().unwrap();
                let minimal = config_minimal_header(&headers);
                match store::save_config(&config, &runtime.config_path, Some(fmt), minimal) {
                    Ok(()) => {
                        runtime.apply_config(config, Some(fmt));
                        Json(json!({"ok": true, "format": fmt.to_string()})).into_response()
                    }
                    Err(err) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
                }
            }
            Err(err) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        },
        Err(err) => json_error(StatusCode::BAD_REQUEST, err),
    }
}

async fn post_validate(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(runtime): State<Arc<RuntimeState>>,
    body: Bytes,
) -> Response {
    if let Err(response) = ensure_admin_access(&peer, &runtime) {
        return response;
    }

    match parse_update_body(&body) {
        Ok(ConfigUpdateBody::Raw { content, format }) => {
            let fmt = format
                .as_deref()
                .and_then(ConfigFormat::parse)
                .unwrap_or_else(|| store::detect_format(&content));
            match store::validate_config_raw(&content, fmt) {
                Ok(_) => Json(ValidateOkPayload { ok: true }).into_response(),
                Err(err) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
            }
        }
        Ok(ConfigUpdateBody::Structured(value)) => match config_from_structured(value) {
            Ok(_) => Json(ValidateOkPayload { ok: true }).into_response(),
            Err(err) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        },
        Err(err) => json_error(StatusCode::BAD_REQUEST, err),
    }
}

async fn healthz() -> Response {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")})).into_response()
}

pub fn router() -> Router<Arc<RuntimeState>> {
    Router::new()
        .route("/ui", get(get_ui))
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/config/validate", axum::routing::post(post_validate))
        .route("/healthz", get(healthz))
}
