//! Forwarding Engine: builds the upstream request from the matched route,
//! issues it, and turns the upstream response into one of our own.
//!
//! Grounded in `original_source/.../proxy/engine.py` (`forward_request`,
//! `merge_params`, `clean_headers`, `process_response`, `error_response`).
//! Where the original dispatches through `httpx`, this uses `reqwest`
//! against the `RuntimeState`'s swappable client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{RequestRules, Route};
use crate::masking::{is_maskable_content_type, mask_content};
use crate::runtime::RuntimeState;

const REQUEST_ID_HEADER: &str = "x-request-id";

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string())
}

/// Merge the incoming query string with the route's `add_params`/`del_params`.
/// Repeated keys and relative order in the incoming query are preserved;
/// an `add_params` key overrides any same-named incoming values; deletions
/// win over additions for the same key.
fn merge_params(uri: &Uri, rules: &RequestRules) -> Vec<(String, String)> {
    let incoming: Vec<(String, String)> = uri
        .query()
        .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let mut merged: Vec<(String, String)> = incoming
        .into_iter()
        .filter(|(key, _)| !rules.add_params.contains_key(key))
        .collect();
    merged.extend(rules.add_params.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.retain(|(key, _)| !rules.del_params.iter().any(|del| del == key));
    merged
}

/// Strip hop-by-hop / configured headers and append the route's `add_headers`.
fn clean_headers(headers: &HeaderMap, strip_list: &[String], add_headers: &BTreeMap<String, String>) -> HeaderMap {
    let blacklist: std::collections::HashSet<String> =
        strip_list.iter().map(|h| h.to_ascii_lowercase()).collect();

    let mut cleaned = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !blacklist.contains(name.as_str()) {
            cleaned.insert(name.clone(), value.clone());
        }
    }
    for (key, value) in add_headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(key.as_str()), HeaderValue::from_str(value)) {
            cleaned.insert(name, value);
        }
    }
    cleaned
}

fn upstream_url(route: &Route, path: &str, query_pairs: &[(String, String)]) -> String {
    let suffix = path.strip_prefix(route.path.as_str()).unwrap_or(path);
    let mut url = format!("{}{}", route.target.trim_end_matches('/'), suffix);
    if !query_pairs.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query_pairs)
            .finish();
        url.push('?');
        url.push_str(&query);
    }
    url
}

fn error_response(status: StatusCode, message: &str, request_id: &str, path: &str) -> Response {
    let mut response = (
        status,
        axum::Json(json!({
            "error": message,
            "request_id": request_id,
            "path": path,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub async fn forward_request(
    state: Arc<RuntimeState>,
    route: &Route,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let config = state.config.load();
    let path = uri.path();

    let query_pairs = merge_params(&uri, &route.request_rules);
    let url = upstream_url(route, path, &query_pairs);
    let req_headers = clean_headers(&headers, &config.proxy.strip_headers, &route.request_rules.add_headers);

    let client = state.http_client.load();
    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid Method", &request_id, path),
    };

    let start = Instant::now();
    let result = client
        .request(reqwest_method, url)
        .headers(req_headers)
        .body(body)
        .send()
        .await;

    let upstream_resp = match result {
        Ok(resp) => resp,
        Err(err) if err.is_timeout() => {
            warn!(request_id = %request_id, route = %route.name, "upstream timeout");
            return error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout", &request_id, path);
        }
        Err(err) if err.is_connect() => {
            warn!(request_id = %request_id, route = %route.name, error = %err, "upstream connection failed");
            return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway", &request_id, path);
        }
        Err(err) => {
            warn!(request_id = %request_id, route = %route.name, error = %err, "upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway", &request_id, path);
        }
    };

    let duration_ms = start.elapsed().as_millis();
    let status = upstream_resp.status();
    info!(
        request_id = %request_id,
        route = %route.name,
        upstream_ms = duration_ms,
        status_code = status.as_u16(),
        "request forwarded"
    );

    process_response(upstream_resp, route, config.proxy.max_response_size, &request_id, path).await
}

/// Buffer + mask when the body is text-ish and within the size cap;
/// otherwise stream the upstream body through untouched. Either way, the
/// chosen request id is echoed back as an `X-Request-Id` header.
async fn process_response(
    upstream_resp: reqwest::Response,
    route: &Route,
    max_response_size: u64,
    request_id: &str,
    path: &str,
) -> Response {
    let status = StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream_resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase())
        .unwrap_or_default();
    let content_length = upstream_resp
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_resp.headers().iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        response_headers.insert("x-request-id", value);
    }

    if !is_maskable_content_type(&content_type) || (content_length > 0 && content_length > max_response_size) {
        let stream = upstream_resp.bytes_stream();
        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = response_headers;
        return builder.body(Body::from_stream(stream)).unwrap().into_response();
    }

    let text = match upstream_resp.text().await {
        Ok(text) => text,
        Err(_) => return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway", request_id, path),
    };
    let masked = mask_content(&text, &route.response_rules.mask_regex);
    response_headers.remove(reqwest::header::CONTENT_LENGTH.as_str());

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = response_headers;
    builder.body(Body::from(masked)).unwrap().into_response()
}
