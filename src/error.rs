//! Error taxonomy for the gateway.
//!
//! Every non-2xx response carries an OpenAI-style body:
//! `{"error": {"code": "...", "message": "...", "type": "..."}}`.

use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;

/// Seconds suggested to clients when a model queue is full.
pub const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 30;

/// Errors surfaced by the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model not found: {model}. Available models: {known:?}")]
    ModelNotFound { model: String, known: Vec<String> },

    #[error("model {model} failed to start: {reason}")]
    StartFailure { model: String, reason: String },

    #[error("queue full for model {0}")]
    QueueFull(String),

    #[error("request timed out waiting for model {0}")]
    QueueTimeout(String),

    #[error("queue cleared for model {0}")]
    QueueCleared(String),

    #[error("backend error for model {model}: {reason}")]
    BackendTransport { model: String, reason: String },

    #[error("no capacity for model {0}: all slots busy and no evictable model")]
    AdmissionDenied(String),

    #[error("request body too large (limit {0} bytes)")]
    PayloadTooLarge(usize),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Machine-readable snake_case error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config_error",
            GatewayError::ModelNotFound { .. } => "model_not_found",
            GatewayError::StartFailure { .. } => "start_failed",
            GatewayError::QueueFull(_) => "queue_full",
            GatewayError::QueueTimeout(_) => "queue_timeout",
            GatewayError::QueueCleared(_) => "queue_cleared",
            GatewayError::BackendTransport { .. } => "upstream_error",
            GatewayError::AdmissionDenied(_) => "no_capacity",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Error category reported in the body's `type` field.
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::ModelNotFound { .. } => "not_found",
            GatewayError::StartFailure { .. }
            | GatewayError::QueueFull(_)
            | GatewayError::QueueCleared(_)
            | GatewayError::AdmissionDenied(_) => "unavailable",
            GatewayError::QueueTimeout(_) => "timeout",
            GatewayError::BackendTransport { .. } => "upstream",
            GatewayError::PayloadTooLarge(_) | GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::StartFailure { .. }
            | GatewayError::QueueFull(_)
            | GatewayError::QueueCleared(_)
            | GatewayError::AdmissionDenied(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::QueueTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendTransport { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Build an error response with the standard body shape.
pub fn error_response(status: StatusCode, code: &str, category: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "code": code,
            "message": message,
            "type": category,
        }
    });

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");

    if code == "queue_full" {
        builder = builder.header(header::RETRY_AFTER, QUEUE_FULL_RETRY_AFTER_SECS.to_string());
    }

    builder
        .body(Body::from(body.to_string()))
        .expect("static error response")
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        error_response(self.status(), self.code(), self.category(), &self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let err = GatewayError::ModelNotFound {
            model: "llama".into(),
            known: vec!["mistral".into()],
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "model_not_found");
        assert_eq!(json["error"]["type"], "not_found");
        assert!(json["error"]["message"].as_str().unwrap().contains("mistral"));
    }

    #[tokio::test]
    async fn test_queue_full_sets_retry_after() {
        let resp = GatewayError::QueueFull("llama".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &QUEUE_FULL_RETRY_AFTER_SECS.to_string()
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::QueueTimeout("m".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::BackendTransport {
                model: "m".into(),
                reason: "refused".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::AdmissionDenied("m".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::PayloadTooLarge(10).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
