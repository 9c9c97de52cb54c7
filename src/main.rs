//! llamagate - on-demand multiplexing of llama-server backends behind
//! one OpenAI-compatible endpoint.
//!
//! Exit codes: 0 normal shutdown, 1 fatal configuration error at boot,
//! 2 failure to bind the gateway's own listener.

use anyhow::Context;
use clap::Parser;
use llamagate::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llamagate")]
#[command(about = "OpenAI-compatible gateway for on-demand llama-server backends")]
struct Args {
    /// Path to the configuration file (env: CONFIG_PATH)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PROXY_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Backend process output is logged under the "llama" target at debug
    // level; enable with e.g. RUST_LOG=info,llama=debug.
    let filter = if args.verbose {
        EnvFilter::new("llamagate=debug,llama=debug,tower_http=debug")
    } else if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        EnvFilter::new(level.to_lowercase())
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting llamagate");

    let config_path = args
        .config
        .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/models.yaml"));

    let mut config = match Config::from_file(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Some(port) = args.port {
        config.port = port;
    }

    // A stray listener on a model port means a backend we do not own
    // would receive traffic; refuse to boot over it.
    if let Err(e) = llamagate::check_model_ports(&config).await {
        error!(error = %e, "Model port check failed");
        std::process::exit(1);
    }

    telemetry_init();

    let mut model_names: Vec<_> = config.models.keys().cloned().collect();
    model_names.sort();
    info!(
        models = ?model_names,
        port = config.port,
        max_concurrent = config.max_concurrent_models,
        "Configuration loaded"
    );

    let (app, gateway) = match llamagate::build_app(config.clone(), Some(config_path)).await {
        Ok(built) => built,
        Err(e) => {
            error!(error = %e, "Failed to build gateway");
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind gateway listener");
            std::process::exit(2);
        }
    };

    // Preloads and auto-starts run in the background so the listener is
    // responsive immediately; queued requests bridge the gap.
    {
        let controller = gateway.controller.clone();
        tokio::spawn(async move {
            controller.bootstrap().await;
        });
    }

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down");
    gateway.shutdown().await;
    Ok(())
}

fn telemetry_init() {
    if llamagate::telemetry::install().is_none() {
        info!("Metrics recorder already installed, reusing");
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
