//! Mock llama-server for testing llamagate.
//!
//! Accepts the flags the supervisor passes to a real llama-server
//! (`--model`, `--port`, `--host`, `--ctx-size`, `--n-gpu-layers`,
//! `--chat-template`) plus test knobs the integration suite injects via
//! `additional_args`: startup delay, response latency, SSE chunk count
//! and pacing, forced health failure, and immediate exit (to simulate a
//! model that fails to load).
//!
//! Prints `READY <port>` on stdout once the listener is bound.

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-llama")]
#[command(about = "Mock llama-server for testing")]
struct Args {
    /// Model path (llama-server style); echoed back in responses.
    #[arg(long)]
    model: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Accepted for llama-server compatibility; unused.
    #[arg(long, default_value = "4096")]
    #[allow(dead_code)]
    ctx_size: u32,

    /// Accepted for llama-server compatibility; unused.
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    #[allow(dead_code)]
    n_gpu_layers: i32,

    /// Accepted for llama-server compatibility; unused.
    #[arg(long, default_value = "chatml")]
    #[allow(dead_code)]
    chat_template: String,

    /// Delay before binding the listener, to exercise cold-start queueing.
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Per-request latency.
    #[arg(long, default_value = "10")]
    latency_ms: u64,

    /// Exit immediately with this code after printing an error, to
    /// simulate a model that fails to load.
    #[arg(long)]
    exit_code: Option<i32>,

    /// Always answer the health probe with 503.
    #[arg(long)]
    fail_health: bool,

    /// Number of SSE chunks per streaming response.
    #[arg(long, default_value = "3")]
    stream_chunks: usize,

    /// Pause between SSE chunks.
    #[arg(long, default_value = "20")]
    stream_delay_ms: u64,
}

struct MockState {
    model: String,
    latency: Duration,
    fail_health: bool,
    stream_chunks: usize,
    stream_delay: Duration,
    request_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_llama=debug")
        .init();

    let args = Args::parse();

    if let Some(code) = args.exit_code {
        eprintln!("error: failed to load model '{}'", args.model);
        eprintln!("llama_model_load: unable to open gguf file");
        std::process::exit(code);
    }

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "Simulating model load");
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let state = Arc::new(MockState {
        model: args.model.clone(),
        latency: Duration::from_millis(args.latency_ms),
        fail_health: args.fail_health,
        stream_chunks: args.stream_chunks.max(1),
        stream_delay: Duration::from_millis(args.stream_delay_ms),
        request_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();

    info!(model = %args.model, port = actual_port, "Mock llama-server listening");

    // Readiness signal for harnesses that spawn us directly.
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.fail_health {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
struct Message {
    #[allow(dead_code)]
    role: String,
    content: String,
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(state.latency).await;

    let last = request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let content = format!(
        "Mock response from {} (request #{}): You said \"{}\"",
        state.model, count, last
    );

    if request.stream {
        return sse_response(&state, &request.model, &content, count);
    }

    Json(serde_json::json!({
        "id": format!("chatcmpl-mock-{}", count),
        "object": "chat.completion",
        "created": 0,
        "model": request.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 },
    }))
    .into_response()
}

#[derive(Deserialize)]
struct CompletionRequest {
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    stream: bool,
}

async fn completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(state.latency).await;

    let content = format!("{} says: {}", state.model, request.prompt);
    if request.stream {
        return sse_response(&state, &request.model, &content, count);
    }

    Json(serde_json::json!({
        "id": format!("cmpl-mock-{}", count),
        "object": "text_completion",
        "created": 0,
        "model": request.model,
        "choices": [{ "index": 0, "text": content, "finish_reason": "stop" }],
    }))
    .into_response()
}

/// Chunked SSE stream terminated by `data: [DONE]`.
fn sse_response(state: &Arc<MockState>, model: &str, content: &str, count: u64) -> Response {
    let chunks = state.stream_chunks;
    let delay = state.stream_delay;
    let model = model.to_string();
    let content = content.to_string();

    let stream = futures_util::stream::unfold(0usize, move |i| {
        let model = model.clone();
        let content = content.clone();
        async move {
            if i > chunks {
                return None;
            }
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            let frame: Result<String, std::convert::Infallible> = Ok(if i == chunks {
                "data: [DONE]\n\n".to_string()
            } else {
                let payload = serde_json::json!({
                    "id": format!("chatcmpl-mock-{}", count),
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": { "content": format!("{} ", content_piece(&content, i, chunks)) },
                        "finish_reason": serde_json::Value::Null,
                    }],
                });
                format!("data: {}\n\n", payload)
            });
            Some((frame, i + 1))
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response")
}

fn content_piece(content: &str, index: usize, chunks: usize) -> String {
    let words: Vec<&str> = content.split_whitespace().collect();
    let per_chunk = words.len().div_ceil(chunks).max(1);
    words
        .chunks(per_chunk)
        .nth(index)
        .map(|w| w.join(" "))
        .unwrap_or_default()
}

async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "model": state.model,
        "request_count": state.request_count.load(Ordering::SeqCst),
    }))
}
