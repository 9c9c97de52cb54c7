//! Streaming reverse proxy and the client-facing HTTP surface.
//!
//! Inference requests are buffered just far enough to read the `model`
//! field, held in the model's queue across cold starts, then forwarded
//! to `127.0.0.1:<model port>` with hop-by-hop headers stripped. The
//! backend response body is streamed through untouched, SSE included;
//! an in-flight guard rides the response body so the count stays
//! accurate until streaming finishes, and dropping the body (client
//! disconnect) cancels the upstream read.

use crate::error::GatewayError;
use crate::lifecycle::Controller;
use crate::registry::{InFlightGuard, ModelState};
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use bytes::Bytes;
use http_body::Frame;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::counter;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, error};

/// Headers that must not cross the proxy in either direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    pub client: Client<HttpConnector, Body>,
    pub max_body_bytes: usize,
    pub config_path: Option<std::path::PathBuf>,
    pub system: Arc<Mutex<System>>,
}

impl AppState {
    pub fn new(
        controller: Controller,
        max_body_bytes: usize,
        config_path: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            controller,
            client: Client::builder(TokioExecutor::new()).build_http(),
            max_body_bytes,
            config_path,
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

/// Handler for `/v1/chat/completions` and `/v1/completions`.
pub async fn completion_proxy(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Response<Body> {
    match forward_completion(state, req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, "Request rejected");
            e.into_response()
        }
    }
}

async fn forward_completion(
    state: AppState,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let (parts, body) = req.into_parts();

    let body_bytes = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge(state.max_body_bytes))?;

    let model = extract_model(&body_bytes).ok_or_else(|| {
        GatewayError::InvalidRequest("request body must include a \"model\" field".to_string())
    })?;

    // Blocks across the cold start if the model is not Ready yet.
    let entry = state.controller.ensure_ready(&model).await?;
    let guard = InFlightGuard::acquire(&entry);
    let port = entry.config().port;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri: Uri = format!("http://127.0.0.1:{}{}", port, path_and_query)
        .parse()
        .map_err(|e| GatewayError::Internal(format!("invalid proxy URI: {}", e)))?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        copy_request_headers(&parts.headers, headers);
    }
    let backend_req = builder
        .body(Body::from(body_bytes))
        .map_err(|e| GatewayError::Internal(format!("failed to build proxy request: {}", e)))?;

    match state.client.request(backend_req).await {
        Ok(resp) => {
            // Activity is recorded at the response head, not at stream
            // completion; SSE bodies can run for minutes.
            state.controller.note_transport_result(&entry, true);
            entry.touch();
            entry.record_request();
            counter!("llamagate_requests_total", "model" => model.clone()).increment(1);

            let (mut resp_parts, resp_body) = resp.into_parts();
            strip_hop_by_hop(&mut resp_parts.headers);

            let guarded = GuardedBody {
                inner: Body::new(resp_body),
                _guard: Some(guard),
            };
            Ok(Response::from_parts(resp_parts, Body::new(guarded)))
        }
        Err(e) => {
            error!(model = %model, error = %e, "Backend transport error");
            state.controller.note_transport_result(&entry, false);
            counter!("llamagate_transport_errors_total", "model" => model.clone()).increment(1);
            Err(GatewayError::BackendTransport {
                model,
                reason: e.to_string(),
            })
        }
    }
}

/// Pull the model name out of a JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
        && !model.is_empty()
    {
        return Some(model.to_string());
    }
    None
}

fn copy_request_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str())
            || lower == "host"
            || lower == "content-length"
        {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Response body wrapper that holds the in-flight guard until the body
/// is fully consumed (or dropped on client disconnect, which also drops
/// the upstream connection and cancels the backend read).
struct GuardedBody {
    inner: Body,
    _guard: Option<InFlightGuard>,
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// `GET /v1/models`: every configured model, regardless of state.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<_> = state
        .controller
        .registry()
        .names()
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "llamagate",
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": data,
    }))
}

/// `GET /health`: gateway summary plus per-model detail.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.controller.registry();
    let details = registry.status_all();
    let active = details
        .values()
        .filter(|s| s.status == ModelState::Ready)
        .count();

    let memory = {
        let mut system = state.system.lock().unwrap();
        system.refresh_memory();
        serde_json::json!({
            "total_gb": bytes_to_gb(system.total_memory()),
            "available_gb": bytes_to_gb(system.available_memory()),
            "used_gb": bytes_to_gb(system.used_memory()),
        })
    };

    Json(serde_json::json!({
        "status": "healthy",
        "models": {
            "total": details.len(),
            "active": active,
            "details": details,
        },
        "system": { "memory": memory },
    }))
}

/// `GET /metrics`: JSON usage view per model, with process RSS/CPU for
/// live backends.
pub async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.controller.registry();

    // Collect pids first; the sysinfo lock is never held across an await.
    let mut pids = Vec::new();
    for entry in registry.entries() {
        let process = entry.process.lock().await;
        if let Some(pid) = process.as_ref().and_then(|p| p.pid()) {
            pids.push((entry.name.clone(), sysinfo::Pid::from_u32(pid)));
        }
    }

    let mut usage: std::collections::HashMap<String, (f64, f32)> = std::collections::HashMap::new();
    {
        let mut system = state.system.lock().unwrap();
        let refresh: Vec<sysinfo::Pid> = pids.iter().map(|(_, pid)| *pid).collect();
        system.refresh_processes(ProcessesToUpdate::Some(&refresh), true);
        for (name, pid) in &pids {
            if let Some(process) = system.process(*pid) {
                let rss_mb = process.memory() as f64 / 1024.0 / 1024.0;
                usage.insert(name.clone(), (rss_mb, process.cpu_usage()));
            }
        }
    }

    let mut models = serde_json::Map::new();
    for (name, status) in registry.status_all() {
        let (memory_mb, cpu) = usage
            .get(&name)
            .map(|(m, c)| {
                (
                    serde_json::json!((m * 10.0).round() / 10.0),
                    serde_json::json!(c),
                )
            })
            .unwrap_or((serde_json::Value::Null, serde_json::Value::Null));

        models.insert(
            name,
            serde_json::json!({
                "status": status.status,
                "request_count": status.request_count,
                "memory_usage_mb": memory_mb,
                "cpu_usage_percent": cpu,
                "uptime": status.uptime,
                "last_accessed": status.last_accessed,
            }),
        );
    }

    Json(serde_json::json!({
        "timestamp": crate::registry::now_unix_ms() / 1000,
        "models": models,
    }))
}

/// Fallback for paths the gateway does not serve.
pub async fn not_found() -> Response<Body> {
    crate::error::error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        "not_found",
        "unknown endpoint",
    )
}

fn bytes_to_gb(bytes: u64) -> f64 {
    (bytes as f64 / 1024.0 / 1024.0 / 1024.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header};

    #[test]
    fn test_extract_model_from_body() {
        let body = Bytes::from(r#"{"model": "mistral", "messages": []}"#);
        assert_eq!(extract_model(&body), Some("mistral".to_string()));
    }

    #[test]
    fn test_extract_model_missing_or_invalid() {
        assert_eq!(extract_model(&Bytes::from(r#"{"messages": []}"#)), None);
        assert_eq!(extract_model(&Bytes::from(r#"{"model": ""}"#)), None);
        assert_eq!(extract_model(&Bytes::from("not json")), None);
    }

    #[test]
    fn test_request_headers_drop_hop_by_hop_and_host() {
        let mut from = HeaderMap::new();
        from.insert(header::HOST, HeaderValue::from_static("example.com"));
        from.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        from.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_static("42"),
        );
        from.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        from.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        let mut to = HeaderMap::new();
        copy_request_headers(&from, &mut to);

        assert!(to.get(header::HOST).is_none());
        assert!(to.get(header::CONNECTION).is_none());
        assert!(to.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(to.get(header::AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(to.get(header::ACCEPT).unwrap(), "text/event-stream");
    }

    #[test]
    fn test_strip_hop_by_hop_from_response() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
    }

    #[test]
    fn test_bytes_to_gb() {
        assert_eq!(bytes_to_gb(2 * 1024 * 1024 * 1024), 2.0);
        assert_eq!(bytes_to_gb(0), 0.0);
    }
}
