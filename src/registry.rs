//! Model registry: the configuration snapshot plus one mutable runtime
//! entry per configured model.
//!
//! Entries hold the state machine's current state, the live process
//! handle, activity counters, and the per-model request queue. Read
//! paths take snapshots; only the lifecycle controller mutates state.

use crate::config::ModelConfig;
use crate::queue::{QueueSettings, RequestQueue};
use crate::supervisor::BackendProcess;
use metrics::gauge;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Lifecycle state of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Reloading,
    Failed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Stopped => "stopped",
            ModelState::Starting => "starting",
            ModelState::Ready => "ready",
            ModelState::Stopping => "stopping",
            ModelState::Reloading => "reloading",
            ModelState::Failed => "failed",
        }
    }

    /// States that occupy a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ModelState::Starting | ModelState::Ready | ModelState::Reloading
        )
    }
}

/// Mutable runtime record for one configured model.
pub struct ModelEntry {
    pub name: String,
    config: RwLock<Arc<ModelConfig>>,
    state: Mutex<ModelState>,
    pub process: tokio::sync::Mutex<Option<BackendProcess>>,
    pub queue: RequestQueue,
    /// Serializes lifecycle transitions; exactly one in flight per model.
    pub transition: tokio::sync::Mutex<()>,
    last_activity_ms: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    request_count: AtomicU64,
    failure_streak: AtomicU32,
    in_flight: AtomicUsize,
    in_flight_changed: Notify,
    last_error: Mutex<Option<String>>,
}

impl ModelEntry {
    pub fn new(config: ModelConfig) -> Arc<Self> {
        let name = config.name.clone();
        Arc::new(Self {
            queue: RequestQueue::new(name.clone()),
            name,
            config: RwLock::new(Arc::new(config)),
            state: Mutex::new(ModelState::Stopped),
            process: tokio::sync::Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            last_activity_ms: AtomicU64::new(0),
            started_at: Mutex::new(None),
            request_count: AtomicU64::new(0),
            failure_streak: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            in_flight_changed: Notify::new(),
            last_error: Mutex::new(None),
        })
    }

    pub fn config(&self) -> Arc<ModelConfig> {
        Arc::clone(&self.config.read().unwrap())
    }

    pub fn set_config(&self, config: ModelConfig) {
        *self.config.write().unwrap() = Arc::new(config);
    }

    pub fn state(&self) -> ModelState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ModelState) {
        *self.state.lock().unwrap() = state;
        gauge!("llamagate_model_up", "model" => self.name.clone())
            .set(if state == ModelState::Ready { 1.0 } else { 0.0 });
    }

    /// Record traffic: bump the activity timestamp (last-writer-wins).
    pub fn touch(&self) {
        self.last_activity_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Unix millis of the last activity; `None` before first traffic.
    pub fn last_activity_ms(&self) -> Option<u64> {
        match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// How long this model has been idle, measured from the last
    /// activity or, absent traffic, from process start.
    pub fn idle_for(&self) -> Option<Duration> {
        if let Some(ms) = self.last_activity_ms() {
            let now = now_unix_ms();
            return Some(Duration::from_millis(now.saturating_sub(ms)));
        }
        self.started_at
            .lock()
            .unwrap()
            .map(|started| started.elapsed())
    }

    pub fn mark_started(&self) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.failure_streak.store(0, Ordering::Relaxed);
    }

    pub fn mark_stopped(&self) {
        *self.started_at.lock().unwrap() = None;
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.lock().unwrap().map(|s| s.elapsed())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap() = error;
    }

    /// Record a transport result against the failure streak. Returns the
    /// streak length after this failure (0 on success).
    pub fn record_transport_result(&self, ok: bool) -> u32 {
        if ok {
            self.failure_streak.store(0, Ordering::Relaxed);
            0
        } else {
            self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no request is in flight, bounded by `timeout`.
    /// Returns false if the bound expired with requests still running.
    pub async fn wait_in_flight_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let notified = self.in_flight_changed.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    pub fn status(&self) -> ModelStatus {
        let config = self.config();
        ModelStatus {
            status: self.state(),
            port: config.port,
            priority: config.priority,
            resource_group: config.resource_group.clone(),
            preload: config.preload,
            auto_start: config.auto_start,
            queue_depth: self.queue.depth(),
            in_flight: self.in_flight(),
            request_count: self.request_count(),
            last_accessed: self.last_activity_ms().map(|ms| ms / 1000),
            uptime: self.uptime().map(format_uptime),
            error: self.last_error(),
        }
    }
}

/// Guard counting one in-flight forward; held until the response body is
/// fully consumed or dropped.
pub struct InFlightGuard {
    entry: Arc<ModelEntry>,
}

impl InFlightGuard {
    pub fn acquire(entry: &Arc<ModelEntry>) -> Self {
        let count = entry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("llamagate_in_flight", "model" => entry.name.clone()).set(count as f64);
        Self {
            entry: Arc::clone(entry),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
        gauge!("llamagate_in_flight", "model" => self.entry.name.clone())
            .set(prev.saturating_sub(1) as f64);
        if prev == 1 {
            self.entry.in_flight_changed.notify_waiters();
        }
    }
}

/// Read-only status view of one model, shared by the admin surface, the
/// JSON metrics view, and the status channel.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub status: ModelState,
    pub port: u16,
    pub priority: u8,
    pub resource_group: String,
    pub preload: bool,
    pub auto_start: bool,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub request_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Map from model name to runtime entry, plus gateway-level queue
/// defaults.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<ModelEntry>>>,
    default_queue: QueueSettings,
}

impl Registry {
    pub fn new(models: HashMap<String, ModelConfig>, default_queue: QueueSettings) -> Self {
        let entries = models
            .into_values()
            .map(|config| (config.name.clone(), ModelEntry::new(config)))
            .collect();
        Self {
            entries: RwLock::new(entries),
            default_queue,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelEntry>> {
        self.entries.read().unwrap().get(name).cloned()
    }

    pub fn insert(&self, config: ModelConfig) -> Arc<ModelEntry> {
        let entry = ModelEntry::new(config);
        self.entries
            .write()
            .unwrap()
            .insert(entry.name.clone(), Arc::clone(&entry));
        entry
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ModelEntry>> {
        self.entries.write().unwrap().remove(name)
    }

    pub fn entries(&self) -> Vec<Arc<ModelEntry>> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Count of entries currently holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.state().is_active())
            .count()
    }

    /// Count used for admission: a model still tearing down keeps its
    /// slot until the process is reaped, so Stopping counts too.
    pub fn occupied_count(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| {
                matches!(
                    e.state(),
                    ModelState::Starting
                        | ModelState::Ready
                        | ModelState::Stopping
                        | ModelState::Reloading
                )
            })
            .count()
    }

    /// Queue limits for one model: per-model override or gateway default.
    pub fn queue_settings(&self, entry: &ModelEntry) -> QueueSettings {
        let config = entry.config();
        QueueSettings {
            capacity: config.max_queue_size.unwrap_or(self.default_queue.capacity),
            request_timeout: config
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.default_queue.request_timeout),
        }
    }

    /// Status snapshot of every configured model, sorted by name.
    pub fn status_all(&self) -> BTreeMap<String, ModelStatus> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status()))
            .collect()
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Human-readable uptime, coarse on purpose.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_registry() -> Registry {
        let config = Config::from_yaml(
            r#"
models:
  model-a:
    port: 18001
    model_path: /a.gguf
  model-b:
    port: 18002
    model_path: /b.gguf
    priority: 8
    max_queue_size: 7
    request_timeout_secs: 3
"#,
        )
        .unwrap();

        Registry::new(
            config.models,
            QueueSettings {
                capacity: 100,
                request_timeout: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn test_entries_start_stopped() {
        let registry = test_registry();
        assert_eq!(registry.names(), vec!["model-a", "model-b"]);
        assert_eq!(
            registry.get("model-a").unwrap().state(),
            ModelState::Stopped
        );
        assert!(registry.get("model-c").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_queue_settings_overrides() {
        let registry = test_registry();

        let a = registry.get("model-a").unwrap();
        let settings = registry.queue_settings(&a);
        assert_eq!(settings.capacity, 100);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));

        let b = registry.get("model-b").unwrap();
        let settings = registry.queue_settings(&b);
        assert_eq!(settings.capacity, 7);
        assert_eq!(settings.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_active_count_follows_state() {
        let registry = test_registry();
        let a = registry.get("model-a").unwrap();
        let b = registry.get("model-b").unwrap();

        a.set_state(ModelState::Starting);
        assert_eq!(registry.active_count(), 1);
        b.set_state(ModelState::Ready);
        assert_eq!(registry.active_count(), 2);
        a.set_state(ModelState::Failed);
        assert_eq!(registry.active_count(), 1);
        b.set_state(ModelState::Stopping);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_in_flight_guard() {
        let registry = test_registry();
        let entry = registry.get("model-a").unwrap();

        assert_eq!(entry.in_flight(), 0);
        let g1 = InFlightGuard::acquire(&entry);
        let g2 = InFlightGuard::acquire(&entry);
        assert_eq!(entry.in_flight(), 2);
        drop(g1);
        assert_eq!(entry.in_flight(), 1);
        drop(g2);
        assert_eq!(entry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_in_flight_drained() {
        let registry = test_registry();
        let entry = registry.get("model-a").unwrap();

        assert!(entry.wait_in_flight_drained(Duration::from_millis(10)).await);

        let guard = InFlightGuard::acquire(&entry);
        assert!(
            !entry
                .wait_in_flight_drained(Duration::from_millis(50))
                .await
        );

        let waiter = Arc::clone(&entry);
        let handle = tokio::spawn(async move {
            waiter.wait_in_flight_drained(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[test]
    fn test_failure_streak() {
        let registry = test_registry();
        let entry = registry.get("model-a").unwrap();

        assert_eq!(entry.record_transport_result(false), 1);
        assert_eq!(entry.record_transport_result(false), 2);
        assert_eq!(entry.record_transport_result(true), 0);
        assert_eq!(entry.record_transport_result(false), 1);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(45)), "45s");
        assert_eq!(format_uptime(Duration::from_secs(150)), "2m");
        assert_eq!(format_uptime(Duration::from_secs(7800)), "2h 10m");
        assert_eq!(format_uptime(Duration::from_secs(97200)), "1d 3h");
    }

    #[test]
    fn test_status_snapshot() {
        let registry = test_registry();
        let entry = registry.get("model-b").unwrap();
        entry.set_state(ModelState::Ready);
        entry.record_request();
        entry.touch();

        let status = entry.status();
        assert_eq!(status.status, ModelState::Ready);
        assert_eq!(status.port, 18002);
        assert_eq!(status.priority, 8);
        assert_eq!(status.request_count, 1);
        assert!(status.last_accessed.is_some());

        let all = registry.status_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["model-a"].status, ModelState::Stopped);
    }
}
