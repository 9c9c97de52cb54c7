//! # llamagate
//!
//! OpenAI-compatible gateway that multiplexes client requests across a
//! pool of locally-spawned llama-server backends, one model per loopback
//! port. Models start on first demand, stay warm while traffic flows,
//! and are stopped after a configurable idle interval.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       llamagate                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Proxy Forwarder                                    │  │
//! │  │ - Extracts model from request body                 │  │
//! │  │ - Parks requests in the model's queue if not ready │  │
//! │  │ - Streams backend responses straight through       │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Lifecycle Controller                               │  │
//! │  │ - Per-model state machine, serialized transitions  │  │
//! │  │ - Global concurrency cap with priority eviction    │  │
//! │  │ - Idle reaper + queue timeout sweeps               │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Process Supervisor                                 │  │
//! │  │ - Spawns llama-server children, one per model      │  │
//! │  │ - Health-probes to readiness, SIGTERM→SIGKILL stop │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │      ┌───────────────────┼───────────────────┐           │
//! │      ▼                   ▼                   ▼           │
//! │  [llama:19001]      [llama:19002]       [llama:19003]    │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod admin;
mod config;
mod error;
mod lifecycle;
mod proxy;
mod queue;
mod reaper;
mod registry;
mod status;
mod supervisor;
pub mod telemetry;

pub use config::{Config, ModelConfig};
pub use error::GatewayError;
pub use lifecycle::{
    Controller, GroupStatus, LifecycleSettings, ReloadReport, TRANSPORT_FAILURE_THRESHOLD,
    VerbOutcome,
};
pub use proxy::AppState;
pub use queue::{QueueSettings, RequestQueue};
pub use registry::{ModelEntry, ModelState, ModelStatus, Registry};
pub use status::{StatusEvent, StatusHub};
pub use supervisor::{Supervisor, SupervisorSettings};

use axum::Router;
use axum::routing::{get, post};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// A running gateway core: the controller plus its background tasks.
pub struct Gateway {
    pub controller: Controller,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Subscribe to status snapshots and transitions.
    pub fn subscribe_status(&self) -> tokio::sync::broadcast::Receiver<StatusEvent> {
        self.controller.status_hub().subscribe()
    }

    /// Launch preloaded and auto-start models per configuration.
    pub async fn bootstrap(&self) {
        self.controller.bootstrap().await;
    }

    /// Stop background tasks and every backend process.
    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.controller.shutdown_all().await;
    }
}

/// Fail if something already listens on a configured model port: a
/// leftover backend from a previous run would silently serve the wrong
/// weights, so it is a boot error rather than something to adopt.
pub async fn check_model_ports(config: &Config) -> Result<(), GatewayError> {
    for (name, model) in &config.models {
        if supervisor::port_listening(model.port).await {
            return Err(GatewayError::Config(format!(
                "port {} (model {}) already has a listener; stop it or change the port",
                model.port, name
            )));
        }
    }
    Ok(())
}

/// Build the complete gateway stack.
///
/// Returns the Axum router and the [`Gateway`] handle owning the
/// lifecycle controller and background sweepers. `config_path` enables
/// `POST /admin/config/reload`.
pub async fn build_app(
    config: Config,
    config_path: Option<PathBuf>,
) -> Result<(Router, Gateway), GatewayError> {
    config.validate()?;
    info!(models = config.models.len(), "Building gateway");

    let registry = Arc::new(Registry::new(
        config.models.clone(),
        QueueSettings {
            capacity: config.max_queue_size,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        },
    ));

    let supervisor = Supervisor::new(SupervisorSettings {
        command: config.llama_command.clone(),
        health_path: config.health_path.clone(),
        probe_interval: Duration::from_millis(config.probe_interval_ms),
        probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        start_timeout: Duration::from_secs(config.start_timeout_secs),
        stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        log_tail_lines: config.log_tail_lines,
    });

    let controller = Controller::new(
        registry,
        supervisor,
        StatusHub::default(),
        LifecycleSettings {
            max_concurrent_models: config.max_concurrent_models,
            idle_timeout: config.idle_timeout(),
            on_demand_only: config.on_demand_only,
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        },
    );

    let state = AppState::new(controller.clone(), config.max_body_bytes, config_path);

    let app = Router::new()
        .route("/v1/chat/completions", post(proxy::completion_proxy))
        .route("/v1/completions", post(proxy::completion_proxy))
        .route("/v1/models", get(proxy::list_models))
        .route("/health", get(proxy::health))
        .route("/metrics", get(proxy::metrics_json))
        .nest("/admin", admin::router())
        .fallback(proxy::not_found)
        .with_state(state);

    let tasks = vec![
        reaper::spawn_idle_reaper(controller.clone(), config.cleanup_interval()),
        reaper::spawn_queue_sweeper(controller.clone(), Duration::from_secs(5)),
        reaper::spawn_status_ticker(
            controller.clone(),
            Duration::from_secs(config.status_interval_secs.max(1)),
        ),
    ];

    Ok((app, Gateway { controller, tasks }))
}
