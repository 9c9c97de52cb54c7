//! Configuration for llamagate.
//!
//! The config file is YAML with a top-level `models:` map. Everything
//! else has a default and can be overridden per deployment; a handful of
//! settings also accept environment variable overrides (`PROXY_HOST`,
//! `PROXY_PORT`, `TIMEOUT_MINUTES`, `MAX_CONCURRENT_MODELS`).
//!
//! Unknown keys are rejected rather than silently dropped.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Models to manage, keyed by the name clients use in request bodies.
    pub models: HashMap<String, ModelConfig>,

    /// Address the gateway listens on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Gateway port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Command used to spawn backend processes (default: "llama-server").
    /// Can be overridden for testing with mock-llama.
    #[serde(default = "default_llama_command")]
    pub llama_command: String,

    /// Path polled on each backend to declare readiness.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Idle minutes after which a non-preloaded model is stopped.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Interval between idle-reaper sweeps, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Maximum number of models concurrently starting/ready/reloading.
    #[serde(default = "default_max_concurrent_models")]
    pub max_concurrent_models: usize,

    /// When true, nothing starts at boot except preloaded models.
    #[serde(default)]
    pub on_demand_only: bool,

    /// Seconds a backend gets to pass its readiness probe.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Milliseconds between readiness probes.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Per-attempt readiness probe timeout, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Default per-model queue capacity.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Default seconds a queued request waits before timing out.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Largest request body the gateway will buffer.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Lines of backend stdout/stderr kept for diagnostics.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Seconds between periodic status snapshots on the status channel.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

/// Configuration for a single model.
///
/// ```yaml
/// models:
///   llama-3b:
///     port: 19001
///     model_path: ~/models/llama-3b.gguf
///     priority: 7
///     additional_args: ["--parallel 4"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Unique name; filled in from the `models:` map key.
    #[serde(default, skip_serializing, skip_deserializing)]
    pub name: String,

    /// Loopback port owned exclusively by this model's backend.
    pub port: u16,

    /// Path to the model weights. A leading `~` is expanded at load time.
    pub model_path: String,

    #[serde(default = "default_context_length")]
    pub context_length: u32,

    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,

    #[serde(default = "default_chat_format")]
    pub chat_format: String,

    /// Extra launch flags, passed verbatim after the standard arguments.
    /// Entries may be pre-tokenized (`["-c", "4096"]`) or space-joined
    /// (`["-c 4096"]`); space-joined entries are split on whitespace.
    #[serde(default)]
    pub additional_args: Vec<String>,

    /// 1..=10; higher starts first and is evicted last.
    #[serde(default = "default_priority")]
    pub priority: u8,

    #[serde(default = "default_resource_group")]
    pub resource_group: String,

    /// Start at boot (unless the gateway runs on_demand_only).
    #[serde(default)]
    pub auto_start: bool,

    /// Start at boot unconditionally; exempt from idle reaping and stop-all.
    #[serde(default)]
    pub preload: bool,

    /// Queue capacity override for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,

    /// Queue wait timeout override for this model, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_llama_command() -> String {
    "llama-server".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_models() -> usize {
    4
}

fn default_start_timeout_secs() -> u64 {
    180
}

fn default_stop_timeout_secs() -> u64 {
    15
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_max_queue_size() -> usize {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_log_tail_lines() -> usize {
    200
}

fn default_status_interval_secs() -> u64 {
    5
}

fn default_context_length() -> u32 {
    4096
}

fn default_gpu_layers() -> i32 {
    -1
}

fn default_chat_format() -> String {
    "chatml".to_string()
}

fn default_priority() -> u8 {
    5
}

fn default_resource_group() -> String {
    "default".to_string()
}

impl Config {
    /// Load configuration from a YAML file, apply environment overrides,
    /// and validate.
    pub async fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml(&contents)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document. Model names are injected from map keys and
    /// `~` in model paths is expanded; no validation happens here.
    pub fn from_yaml(contents: &str) -> Result<Self, GatewayError> {
        let mut config: Config = serde_yaml::from_str(contents)
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        for (name, model) in config.models.iter_mut() {
            model.name = name.clone();
            model.model_path = expand_home(&model.model_path);
        }

        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PROXY_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PROXY_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(minutes) = std::env::var("TIMEOUT_MINUTES")
            && let Ok(minutes) = minutes.parse()
        {
            self.timeout_minutes = minutes;
        }
        if let Ok(max) = std::env::var("MAX_CONCURRENT_MODELS")
            && let Ok(max) = max.parse()
        {
            self.max_concurrent_models = max;
        }
    }

    /// Reject configurations that cannot be served: duplicate ports,
    /// out-of-range priorities, empty model paths.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.max_concurrent_models == 0 {
            return Err(GatewayError::Config(
                "max_concurrent_models must be at least 1".to_string(),
            ));
        }

        let mut seen_ports: HashMap<u16, &str> = HashMap::new();
        for (name, model) in &self.models {
            if model.model_path.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "model {}: model_path is empty",
                    name
                )));
            }
            if !(1..=10).contains(&model.priority) {
                return Err(GatewayError::Config(format!(
                    "model {}: priority {} out of range 1-10",
                    name, model.priority
                )));
            }
            if let Some(other) = seen_ports.insert(model.port, name) {
                return Err(GatewayError::Config(format!(
                    "port {} is used by both {} and {}",
                    model.port, other, name
                )));
            }
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl ModelConfig {
    /// Build the llama-server argument vector: the standard flags derived
    /// from this config, then `additional_args` with space-joined entries
    /// split on whitespace.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model_path.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--ctx-size".to_string(),
            self.context_length.to_string(),
            "--n-gpu-layers".to_string(),
            self.gpu_layers.to_string(),
            "--chat-template".to_string(),
            self.chat_format.clone(),
        ];

        for arg in &self.additional_args {
            args.extend(arg.split_whitespace().map(str::to_string));
        }

        args
    }

    /// True when a change between two configs requires a process restart.
    pub fn requires_restart(&self, other: &ModelConfig) -> bool {
        self.port != other.port
            || self.model_path != other.model_path
            || self.context_length != other.context_length
            || self.gpu_layers != other.gpu_layers
            || self.chat_format != other.chat_format
            || self.additional_args != other.additional_args
    }
}

/// Expand a leading `~` against the invoking user's home directory.
fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
models:
  llama-3b:
    port: 19001
    model_path: /models/llama-3b.gguf
  mistral:
    port: 19002
    model_path: /models/mistral.gguf
    priority: 7
    preload: true
    additional_args: ["--parallel", "4"]
"#;

    #[test]
    fn test_parse_basic() {
        let config = Config::from_yaml(BASIC).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models["llama-3b"].name, "llama-3b");
        assert_eq!(config.models["llama-3b"].port, 19001);
        assert_eq!(config.models["llama-3b"].priority, 5);
        assert!(config.models["mistral"].preload);
        assert_eq!(config.port, 8000);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
models:
  llama:
    port: 19001
    model_path: /m.gguf
    gpu_count: 2
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let yaml = r#"
models:
  a:
    port: 19001
    model_path: /a.gguf
  b:
    port: 19001
    model_path: /b.gguf
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("19001"));
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let yaml = r#"
models:
  a:
    port: 19001
    model_path: /a.gguf
    priority: 11
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_launch_args_split_space_joined() {
        let config = Config::from_yaml(
            r#"
models:
  a:
    port: 19001
    model_path: /a.gguf
    context_length: 8192
    additional_args: ["-c 4096", "--threads", "8"]
"#,
        )
        .unwrap();

        let args_owned = config.models["a"].launch_args();
        let args: Vec<&str> = args_owned.iter().map(String::as_str).collect();
        assert_eq!(
            &args[..8],
            &[
                "--model",
                "/a.gguf",
                "--port",
                "19001",
                "--host",
                "127.0.0.1",
                "--ctx-size",
                "8192",
            ]
        );
        // Space-joined entry is tokenized, pre-tokenized entries pass through.
        assert!(args.windows(2).any(|w| w == ["-c", "4096"]));
        assert!(args.windows(2).any(|w| w == ["--threads", "8"]));
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_home("~/models/a.gguf"),
            home.join("models/a.gguf").to_string_lossy()
        );
        assert_eq!(expand_home("/abs/path.gguf"), "/abs/path.gguf");
    }

    #[test]
    fn test_requires_restart() {
        let config = Config::from_yaml(BASIC).unwrap();
        let base = config.models["llama-3b"].clone();

        let mut changed = base.clone();
        changed.priority = 9;
        assert!(!base.requires_restart(&changed));

        let mut changed = base.clone();
        changed.model_path = "/models/other.gguf".to_string();
        assert!(base.requires_restart(&changed));

        let mut changed = base.clone();
        changed.additional_args = vec!["--parallel 2".to_string()];
        assert!(base.requires_restart(&changed));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_yaml(BASIC).unwrap();
        // SAFETY: no other thread in this test binary touches these vars
        // concurrently with this test.
        unsafe {
            std::env::set_var("PROXY_PORT", "9123");
            std::env::set_var("MAX_CONCURRENT_MODELS", "2");
        }
        config.apply_env_overrides();
        unsafe {
            std::env::remove_var("PROXY_PORT");
            std::env::remove_var("MAX_CONCURRENT_MODELS");
        }
        assert_eq!(config.port, 9123);
        assert_eq!(config.max_concurrent_models, 2);
    }
}
