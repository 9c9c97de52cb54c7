//! Backend process supervision.
//!
//! Spawns one llama-server child per model, forwards its output as
//! tracing events under the "llama" target (enable with e.g.
//! `RUST_LOG=info,llama=debug`), polls the health endpoint until the
//! backend is ready, and tears processes down with SIGTERM escalating to
//! SIGKILL. Children are always reaped before a stop returns.

use crate::config::ModelConfig;
use crate::error::GatewayError;
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Supervisor knobs, resolved once from the gateway config.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub command: String,
    pub health_path: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub log_tail_lines: usize,
}

/// A live backend child and its diagnostic tail buffer.
pub struct BackendProcess {
    child: Child,
    pub port: u16,
    pub started_at: Instant,
    log_tail: Arc<Mutex<VecDeque<String>>>,
}

impl BackendProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// The last captured lines of backend output, newest last.
    pub fn tail_excerpt(&self) -> String {
        let tail = self.log_tail.lock().unwrap();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Non-blocking liveness check; returns the exit status if the child
    /// has already terminated.
    pub fn try_exited(&mut self) -> Option<std::process::ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to check child status");
                None
            }
        }
    }
}

/// Spawns, readiness-checks, and terminates backend processes.
#[derive(Clone)]
pub struct Supervisor {
    settings: SupervisorSettings,
    probe_client: Client<HttpConnector, Empty<bytes::Bytes>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let probe_client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            settings,
            probe_client,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Spawn the backend for `model` and wait until it answers the health
    /// probe. On failure the child (if any) is killed and reaped, and the
    /// error message carries the tail of the child's output.
    pub async fn spawn(&self, model: &ModelConfig) -> Result<BackendProcess, GatewayError> {
        if port_listening(model.port).await {
            return Err(GatewayError::StartFailure {
                model: model.name.clone(),
                reason: format!("port {} is already in use", model.port),
            });
        }

        let args = model.launch_args();
        info!(model = %model.name, port = model.port, command = %self.settings.command, "Starting backend");
        debug!(model = %model.name, args = ?args, "Backend command args");

        // Own process group so the whole tree can be signalled at once.
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&args)
            .env("NO_COLOR", "1")
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| GatewayError::StartFailure {
            model: model.name.clone(),
            reason: format!("failed to spawn {}: {}", self.settings.command, e),
        })?;

        let log_tail = Arc::new(Mutex::new(VecDeque::with_capacity(
            self.settings.log_tail_lines,
        )));

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(
                stdout,
                model.name.clone(),
                "stdout",
                Arc::clone(&log_tail),
                self.settings.log_tail_lines,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(
                stderr,
                model.name.clone(),
                "stderr",
                Arc::clone(&log_tail),
                self.settings.log_tail_lines,
            );
        }

        let mut process = BackendProcess {
            child,
            port: model.port,
            started_at: Instant::now(),
            log_tail,
        };

        let health_url = format!("http://127.0.0.1:{}{}", model.port, self.settings.health_path);
        let started = Instant::now();

        loop {
            if started.elapsed() > self.settings.start_timeout {
                let _ = process.child.kill().await;
                return Err(self.start_failure(
                    model,
                    &process,
                    format!(
                        "readiness not reached within {}s",
                        self.settings.start_timeout.as_secs()
                    ),
                ));
            }

            match self.probe(&health_url).await {
                Ok(true) => {
                    info!(model = %model.name, port = model.port, pid = ?process.pid(), "Backend is ready");
                    return Ok(process);
                }
                Ok(false) => {
                    debug!(model = %model.name, "Health probe returned non-2xx, retrying");
                }
                Err(e) => {
                    debug!(model = %model.name, error = %e, "Health probe failed, retrying");
                }
            }

            if let Some(status) = process.try_exited() {
                // The pipe readers may still be flushing the final lines.
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(self.start_failure(
                    model,
                    &process,
                    format!("process exited before ready: {}", status),
                ));
            }

            tokio::time::sleep(self.settings.probe_interval).await;
        }
    }

    /// Graceful stop: SIGTERM the process group, wait up to the stop
    /// timeout, then SIGKILL. The child is reaped before returning, so
    /// the port is reusable immediately after.
    pub async fn shutdown(&self, model: &str, mut process: BackendProcess) {
        let pid = process.pid();
        info!(model = %model, pid = ?pid, "Stopping backend");

        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }

        match tokio::time::timeout(self.settings.stop_timeout, process.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(model = %model, status = %status, "Backend exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(model = %model, error = %e, "Failed waiting for backend exit");
            }
            Err(_) => {
                warn!(
                    model = %model,
                    timeout_secs = self.settings.stop_timeout.as_secs(),
                    "Backend ignored SIGTERM, escalating to SIGKILL"
                );
                if let Some(pid) = pid {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
                // kill() also reaps the child.
                let _ = process.child.kill().await;
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<bool, String> {
        let uri: hyper::Uri = url.parse().map_err(|e| format!("invalid URL: {}", e))?;

        let request = hyper::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Empty::new())
            .map_err(|e| format!("failed to build request: {}", e))?;

        let result = tokio::time::timeout(
            self.settings.probe_timeout,
            self.probe_client.request(request),
        )
        .await;

        match result {
            Ok(Ok(response)) => Ok(response.status().is_success()),
            Ok(Err(e)) => Err(format!("request failed: {}", e)),
            Err(_) => Err("probe timeout".to_string()),
        }
    }

    fn start_failure(
        &self,
        model: &ModelConfig,
        process: &BackendProcess,
        reason: String,
    ) -> GatewayError {
        let tail = process.tail_excerpt();
        let reason = if tail.is_empty() {
            reason
        } else {
            format!("{}; last output:\n{}", reason, tail)
        };
        GatewayError::StartFailure {
            model: model.name.clone(),
            reason,
        }
    }
}

/// True when something is already accepting connections on the loopback
/// port this model would own.
pub async fn port_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(250),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

fn spawn_line_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    model: String,
    stream_name: &'static str,
    tail: Arc<Mutex<VecDeque<String>>>,
    tail_cap: usize,
) {
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let clean = strip_ansi(&line);
            if clean.is_empty() {
                continue;
            }
            debug!(target: "llama", model = %model, stream = stream_name, "{}", clean);
            push_tail(&tail, tail_cap, clean);
        }
    });
}

fn push_tail(tail: &Mutex<VecDeque<String>>, cap: usize, line: String) {
    let mut tail = tail.lock().unwrap();
    if tail.len() >= cap {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Negative pid targets the process group created at spawn.
    if let Err(e) = kill(Pid::from_raw(-(pid as i32)), signal) {
        // Fall back to the child itself if the group is already gone.
        if let Err(e2) = kill(Pid::from_raw(pid as i32), signal) {
            warn!(pid, %signal, group_err = %e, err = %e2, "Failed to signal backend");
        }
    }
}

/// Strip ANSI escape sequences from a line of backend output.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("hello"), "hello");
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(
            strip_ansi("\x1b[1;32mgreen bold\x1b[0m text"),
            "green bold text"
        );
    }

    #[test]
    fn test_push_tail_caps_buffer() {
        let tail = Mutex::new(VecDeque::new());
        for i in 0..10 {
            push_tail(&tail, 3, format!("line {}", i));
        }
        let tail = tail.lock().unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.front().unwrap(), "line 7");
        assert_eq!(tail.back().unwrap(), "line 9");
    }

    #[tokio::test]
    async fn test_port_listening_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_listening(port).await);
        drop(listener);
    }
}
