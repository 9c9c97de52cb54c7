//! Admin surface: idempotent control verbs and read-only views under
//! `/admin`.
//!
//! | Method | Path                           | Description                      |
//! |--------|--------------------------------|----------------------------------|
//! | POST   | `/admin/models/{name}/start`   | Start one model                  |
//! | POST   | `/admin/models/{name}/stop`    | Stop one model                   |
//! | POST   | `/admin/models/{name}/reload`  | Swap one model's process         |
//! | GET    | `/admin/models/{name}/status`  | Per-model status                 |
//! | POST   | `/admin/models/start-all`      | Start everything, priority order |
//! | POST   | `/admin/models/stop-all`       | Stop all but preloaded           |
//! | POST   | `/admin/models/restart-all`    | Restart running models           |
//! | POST   | `/admin/groups/{group}/start`  | Start a resource group           |
//! | POST   | `/admin/groups/{group}/stop`   | Stop a resource group            |
//! | GET    | `/admin/groups/status`         | Group rollups                    |
//! | GET    | `/admin/queue/status`          | All queues                       |
//! | GET    | `/admin/queue/{name}/status`   | One queue                        |
//! | POST   | `/admin/queue/{name}/clear`    | Resolve queued requests with 503 |
//! | POST   | `/admin/config/reload`         | Re-read the config file diff     |
//!
//! Bulk verbs report per-model success and never abort on partial
//! failure.

use crate::config::Config;
use crate::error::GatewayError;
use crate::lifecycle::VerbOutcome;
use crate::proxy::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/models/{name}/start", post(start_model))
        .route("/models/{name}/stop", post(stop_model))
        .route("/models/{name}/reload", post(reload_model))
        .route("/models/{name}/status", get(model_status))
        .route("/models/start-all", post(start_all))
        .route("/models/stop-all", post(stop_all))
        .route("/models/restart-all", post(restart_all))
        .route("/groups/{group}/start", post(start_group))
        .route("/groups/{group}/stop", post(stop_group))
        .route("/groups/status", get(groups_status))
        .route("/queue/status", get(queue_status_all))
        .route("/queue/{name}/status", get(queue_status))
        .route("/queue/{name}/clear", post(queue_clear))
        .route("/config/reload", post(config_reload))
}

#[derive(Serialize)]
struct VerbResponse {
    message: String,
    outcome: VerbOutcome,
}

#[derive(Serialize)]
struct BulkResponse {
    message: String,
    results: BTreeMap<String, bool>,
}

fn bulk_response(verb: &str, results: BTreeMap<String, bool>) -> Json<BulkResponse> {
    let ok = results.values().filter(|v| **v).count();
    Json(BulkResponse {
        message: format!("{} {}/{} models", verb, ok, results.len()),
        results,
    })
}

async fn start_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VerbResponse>, GatewayError> {
    let outcome = state.controller.start_model(&name).await?;
    let message = match outcome {
        VerbOutcome::AlreadyRunning => format!("Model '{}' is already running", name),
        _ => format!("Model '{}' started", name),
    };
    Ok(Json(VerbResponse { message, outcome }))
}

async fn stop_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VerbResponse>, GatewayError> {
    let outcome = state.controller.stop_model(&name).await?;
    let message = match outcome {
        VerbOutcome::AlreadyStopped => format!("Model '{}' was not running (no-op)", name),
        _ => format!("Model '{}' stopped", name),
    };
    Ok(Json(VerbResponse { message, outcome }))
}

async fn reload_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VerbResponse>, GatewayError> {
    let outcome = state.controller.reload_model(&name).await?;
    let message = match outcome {
        VerbOutcome::NotRunning => format!("Model '{}' is not running, nothing to reload", name),
        _ => format!("Model '{}' reloaded", name),
    };
    Ok(Json(VerbResponse { message, outcome }))
}

async fn model_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let entry = state
        .controller
        .registry()
        .get(&name)
        .ok_or_else(|| GatewayError::ModelNotFound {
            model: name.clone(),
            known: state.controller.registry().names(),
        })?;
    Ok(Json(serde_json::to_value(entry.status()).unwrap_or_default()))
}

async fn start_all(State(state): State<AppState>) -> Json<BulkResponse> {
    bulk_response("Started", state.controller.start_all().await)
}

async fn stop_all(State(state): State<AppState>) -> Json<BulkResponse> {
    bulk_response("Stopped", state.controller.stop_all().await)
}

async fn restart_all(State(state): State<AppState>) -> Json<BulkResponse> {
    bulk_response("Restarted", state.controller.restart_all().await)
}

async fn start_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Json<BulkResponse> {
    let results = state.controller.start_group(&group).await;
    let ok = results.values().filter(|v| **v).count();
    Json(BulkResponse {
        message: format!("Started {}/{} models in group '{}'", ok, results.len(), group),
        results,
    })
}

async fn stop_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Json<BulkResponse> {
    let results = state.controller.stop_group(&group).await;
    let ok = results.values().filter(|v| **v).count();
    Json(BulkResponse {
        message: format!("Stopped {}/{} models in group '{}'", ok, results.len(), group),
        results,
    })
}

async fn groups_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.controller.group_status()).unwrap_or_default())
}

#[derive(Serialize)]
struct QueueStatus {
    state: crate::registry::ModelState,
    depth: usize,
    capacity: usize,
    in_flight: usize,
}

fn queue_status_of(state: &AppState, entry: &crate::registry::ModelEntry) -> QueueStatus {
    let settings = state.controller.registry().queue_settings(entry);
    QueueStatus {
        state: entry.state(),
        depth: entry.queue.depth(),
        capacity: settings.capacity,
        in_flight: entry.in_flight(),
    }
}

async fn queue_status_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut queues = BTreeMap::new();
    for entry in state.controller.registry().entries() {
        queues.insert(entry.name.clone(), queue_status_of(&state, &entry));
    }
    Json(serde_json::to_value(queues).unwrap_or_default())
}

async fn queue_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let entry = state
        .controller
        .registry()
        .get(&name)
        .ok_or_else(|| GatewayError::ModelNotFound {
            model: name.clone(),
            known: state.controller.registry().names(),
        })?;
    Ok(Json(
        serde_json::to_value(queue_status_of(&state, &entry)).unwrap_or_default(),
    ))
}

#[derive(Serialize)]
struct ClearResponse {
    message: String,
    cleared: usize,
}

async fn queue_clear(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClearResponse>, GatewayError> {
    let entry = state
        .controller
        .registry()
        .get(&name)
        .ok_or_else(|| GatewayError::ModelNotFound {
            model: name.clone(),
            known: state.controller.registry().names(),
        })?;
    let cleared = entry.queue.clear();
    Ok(Json(ClearResponse {
        message: format!("Cleared queue for model '{}'", name),
        cleared,
    }))
}

#[derive(Serialize)]
struct ReloadResponse {
    message: String,
    changes: crate::lifecycle::ReloadReport,
}

/// Re-read the config file and apply the model diff. Gateway-level
/// settings (ports, timeouts) are fixed for the process lifetime.
async fn config_reload(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, GatewayError> {
    let Some(path) = state.config_path.clone() else {
        return Err(GatewayError::Config(
            "gateway was started without a config file; nothing to reload".to_string(),
        ));
    };

    let new_config = Config::from_file(&path).await?;
    let changes = state
        .controller
        .apply_model_configs(new_config.models)
        .await;

    let message = if changes.is_noop() {
        "Configuration unchanged".to_string()
    } else {
        "Configuration reloaded".to_string()
    };
    Ok(Json(ReloadResponse { message, changes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Controller, LifecycleSettings};
    use crate::queue::QueueSettings;
    use crate::registry::{ModelState, Registry};
    use crate::status::StatusHub;
    use crate::supervisor::{Supervisor, SupervisorSettings};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Config::from_yaml(
            r#"
models:
  model-a:
    port: 18201
    model_path: /a.gguf
    resource_group: gpu
  model-b:
    port: 18202
    model_path: /b.gguf
"#,
        )
        .unwrap();

        let registry = Arc::new(Registry::new(
            config.models,
            QueueSettings {
                capacity: 100,
                request_timeout: Duration::from_secs(5),
            },
        ));
        let supervisor = Supervisor::new(SupervisorSettings {
            command: "llamagate-test-no-such-binary".to_string(),
            health_path: "/health".to_string(),
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            start_timeout: Duration::from_millis(200),
            stop_timeout: Duration::from_millis(200),
            log_tail_lines: 20,
        });
        let controller = Controller::new(
            registry,
            supervisor,
            StatusHub::default(),
            LifecycleSettings {
                max_concurrent_models: 4,
                idle_timeout: Duration::from_secs(300),
                on_demand_only: false,
                stop_timeout: Duration::from_millis(200),
            },
        );
        AppState::new(controller, 1024 * 1024, None)
    }

    fn test_app(state: AppState) -> Router {
        Router::new().nest("/admin", router()).with_state(state)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_model_status() {
        let state = test_state();
        state
            .controller
            .registry()
            .get("model-a")
            .unwrap()
            .set_state(ModelState::Ready);
        let app = test_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/models/model-a/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ready");
        assert_eq!(json["port"], 18201);
        assert_eq!(json["resource_group"], "gpu");
    }

    #[tokio::test]
    async fn test_status_unknown_model_is_404() {
        let app = test_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/models/ghost/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "model_not_found");
    }

    #[tokio::test]
    async fn test_stop_on_stopped_reports_noop() {
        let app = test_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/models/model-a/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["outcome"], "already_stopped");
        assert!(json["message"].as_str().unwrap().contains("no-op"));
    }

    #[tokio::test]
    async fn test_start_failure_maps_to_503() {
        let app = test_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/models/model-a/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "start_failed");
    }

    #[tokio::test]
    async fn test_groups_status() {
        let app = test_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/groups/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["gpu"]["total_models"], 1);
        assert_eq!(json["default"]["models"][0], "model-b");
    }

    #[tokio::test]
    async fn test_queue_status_and_clear() {
        let state = test_state();
        let entry = state.controller.registry().get("model-a").unwrap();
        let settings = state.controller.registry().queue_settings(&entry);
        let _rx = entry.queue.enqueue(&settings).unwrap();

        let app = test_app(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/queue/model-a/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["depth"], 1);
        assert_eq!(json["capacity"], 100);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/queue/model-a/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["cleared"], 1);
    }

    #[tokio::test]
    async fn test_stop_all_reports_results() {
        let app = test_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/models/stop-all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["results"]["model-a"], true);
        assert_eq!(json["results"]["model-b"], true);
    }

    #[tokio::test]
    async fn test_config_reload_without_path_is_400() {
        let app = test_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/config/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "config_error");
    }
}
