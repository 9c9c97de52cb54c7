//! Lifecycle controller: the per-model state machine.
//!
//! Allowed transitions:
//!
//! | From      | Event                     | To        |
//! |-----------|---------------------------|-----------|
//! | Stopped   | start-request             | Starting  |
//! | Starting  | ready                     | Ready     |
//! | Starting  | start-timeout / exit      | Failed    |
//! | Failed    | start-request             | Starting  |
//! | Ready     | stop-request / idle       | Stopping  |
//! | Ready     | reload-request            | Reloading |
//! | Reloading | ready                     | Ready     |
//! | Reloading | start-timeout             | Failed    |
//! | Stopping  | process-reaped            | Stopped   |
//!
//! All transitions for a given model run under that model's transition
//! mutex, so there is exactly one in flight at a time: a start arriving
//! during Starting parks on the mutex and observes Ready, a stop during
//! Starting waits for readiness before tearing down, a reload during
//! Starting is deferred the same way.
//!
//! Admission: models in {Starting, Ready, Stopping, Reloading} occupy a
//! concurrency slot. Claiming a slot happens under the global admission
//! mutex; when no slot is free, the Ready non-preloaded model with the
//! lowest priority (ties broken by oldest activity) is evicted first.

use crate::config::ModelConfig;
use crate::error::GatewayError;
use crate::registry::{ModelEntry, ModelState, Registry};
use crate::status::StatusHub;
use crate::supervisor::Supervisor;
use futures_util::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive transport failures after which a Ready model is demoted
/// to Failed and torn down.
pub const TRANSPORT_FAILURE_THRESHOLD: u32 = 3;

/// Knobs the controller needs, resolved once from the gateway config.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub max_concurrent_models: usize,
    pub idle_timeout: Duration,
    pub on_demand_only: bool,
    pub stop_timeout: Duration,
}

/// Result of an idempotent admin verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerbOutcome {
    Started,
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
    Reloaded,
    NotRunning,
}

/// Diff applied by a configuration reload.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub updated: Vec<String>,
}

impl ReloadReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.restarted.is_empty()
            && self.updated.is_empty()
    }
}

/// Per-group rollup for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub total_models: usize,
    pub running_models: usize,
    pub models: Vec<String>,
}

struct ControllerInner {
    registry: Arc<Registry>,
    supervisor: Supervisor,
    status: StatusHub,
    settings: LifecycleSettings,
    admission: tokio::sync::Mutex<()>,
}

/// Handle to the lifecycle state machine; cheap to clone.
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Controller {
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Supervisor,
        status: StatusHub,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                registry,
                supervisor,
                status,
                settings,
                admission: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn status_hub(&self) -> &StatusHub {
        &self.inner.status
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    fn get(&self, name: &str) -> Result<Arc<ModelEntry>, GatewayError> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| GatewayError::ModelNotFound {
                model: name.to_string(),
                known: self.inner.registry.names(),
            })
    }

    fn transition(&self, entry: &ModelEntry, state: ModelState) {
        entry.set_state(state);
        self.inner.status.publish_transition(&entry.name, state);
    }

    /// Request-path entry point: return once the model is Ready, parking
    /// the caller in the model's queue across any cold start.
    pub async fn ensure_ready(&self, name: &str) -> Result<Arc<ModelEntry>, GatewayError> {
        let entry = self.get(name)?;
        if entry.state() == ModelState::Ready {
            return Ok(entry);
        }

        let settings = self.inner.registry.queue_settings(&entry);
        let queued_at = Instant::now();
        let rx = entry.queue.enqueue(&settings)?;

        // The model may have become Ready between the state check and the
        // enqueue; nobody else would drain our waiter in that window.
        if entry.state() == ModelState::Ready {
            entry.queue.drain_ready();
        }
        self.trigger_start(&entry);

        // The queue sweeper resolves expired waiters with 504; the bound
        // here is a backstop slightly past it.
        let bound = settings.request_timeout + Duration::from_secs(5);
        let result = match tokio::time::timeout(bound, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Internal(format!(
                "queue for {} was dropped",
                name
            ))),
            Err(_) => Err(GatewayError::QueueTimeout(name.to_string())),
        };

        histogram!("llamagate_queue_wait_seconds", "model" => name.to_string())
            .record(queued_at.elapsed().as_secs_f64());

        result.map(|_| entry)
    }

    /// Kick off a start for a model that is not running. A transition
    /// already in flight will drain the queue itself, so this is a no-op
    /// while one is active.
    fn trigger_start(&self, entry: &Arc<ModelEntry>) {
        match entry.state() {
            ModelState::Starting | ModelState::Reloading | ModelState::Ready => return,
            ModelState::Stopped | ModelState::Stopping | ModelState::Failed => {}
        }

        let controller = self.clone();
        let name = entry.name.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.start_model(&name).await {
                debug!(model = %name, error = %e, "Demand-triggered start failed");
            }
        });
    }

    /// Start a model. Idempotent: Ready returns `AlreadyRunning`
    /// immediately. Queued requests are drained on success and failed
    /// with the start error otherwise.
    pub async fn start_model(&self, name: &str) -> Result<VerbOutcome, GatewayError> {
        let entry = self.get(name)?;
        let _t = entry.transition.lock().await;

        if entry.state() == ModelState::Ready {
            entry.queue.drain_ready();
            return Ok(VerbOutcome::AlreadyRunning);
        }

        // An eviction may have reserved this entry as Stopping between
        // our lock attempt and acquisition; finish that stop first.
        if entry.state() == ModelState::Stopping || entry.process.lock().await.is_some() {
            self.stop_locked(&entry).await;
        }
        if entry.state() == ModelState::Failed {
            entry.set_last_error(None);
        }

        if let Err(e) = self.admit(&entry).await {
            entry
                .queue
                .fail_all(|| GatewayError::AdmissionDenied(entry.name.clone()));
            return Err(e);
        }

        let started = Instant::now();
        let config = entry.config();
        match self.inner.supervisor.spawn(&config).await {
            Ok(process) => {
                *entry.process.lock().await = Some(process);
                entry.mark_started();
                entry.set_last_error(None);
                self.transition(&entry, ModelState::Ready);

                counter!("llamagate_model_starts_total", "model" => name.to_string()).increment(1);
                histogram!("llamagate_start_duration_seconds", "model" => name.to_string())
                    .record(started.elapsed().as_secs_f64());

                let drained = entry.queue.drain_ready();
                if drained > 0 {
                    debug!(model = %name, drained, "Released queued requests");
                }
                Ok(VerbOutcome::Started)
            }
            Err(e) => {
                let reason = match &e {
                    GatewayError::StartFailure { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                warn!(model = %name, error = %reason, "Backend failed to start");
                entry.set_last_error(Some(reason.clone()));
                self.transition(&entry, ModelState::Failed);
                counter!("llamagate_start_failures_total", "model" => name.to_string())
                    .increment(1);

                entry.queue.fail_all(|| GatewayError::StartFailure {
                    model: name.to_string(),
                    reason: reason.clone(),
                });
                Err(e)
            }
        }
    }

    /// Stop a model. Idempotent: already-stopped models report
    /// `AlreadyStopped`; a Failed entry is reset to Stopped.
    pub async fn stop_model(&self, name: &str) -> Result<VerbOutcome, GatewayError> {
        let entry = self.get(name)?;
        let _t = entry.transition.lock().await;

        match entry.state() {
            ModelState::Stopped => Ok(VerbOutcome::AlreadyStopped),
            ModelState::Failed => {
                entry.set_last_error(None);
                self.transition(&entry, ModelState::Stopped);
                Ok(VerbOutcome::AlreadyStopped)
            }
            _ => {
                self.stop_locked(&entry).await;
                Ok(VerbOutcome::Stopped)
            }
        }
    }

    /// Tear down the process and leave the entry Stopped. Caller must
    /// hold the entry's transition lock.
    async fn stop_locked(&self, entry: &Arc<ModelEntry>) {
        if entry.state() != ModelState::Stopping {
            self.transition(entry, ModelState::Stopping);
        }
        let process = entry.process.lock().await.take();
        if let Some(process) = process {
            self.inner.supervisor.shutdown(&entry.name, process).await;
        }
        entry.mark_stopped();
        self.transition(entry, ModelState::Stopped);
        counter!("llamagate_model_stops_total", "model" => entry.name.clone()).increment(1);
    }

    /// Reload a Ready model: let in-flight requests finish against the
    /// old process (bounded), then swap in a fresh one. New traffic
    /// queues during the swap window and is drained on Ready.
    pub async fn reload_model(&self, name: &str) -> Result<VerbOutcome, GatewayError> {
        let entry = self.get(name)?;
        let _t = entry.transition.lock().await;

        if entry.state() != ModelState::Ready {
            return Ok(VerbOutcome::NotRunning);
        }

        info!(model = %name, "Reloading backend");
        self.transition(&entry, ModelState::Reloading);

        if !entry
            .wait_in_flight_drained(self.inner.settings.stop_timeout)
            .await
        {
            warn!(
                model = %name,
                in_flight = entry.in_flight(),
                "In-flight requests outlived the reload window, terminating with old process"
            );
        }

        let old = entry.process.lock().await.take();
        if let Some(old) = old {
            self.inner.supervisor.shutdown(name, old).await;
        }

        let config = entry.config();
        match self.inner.supervisor.spawn(&config).await {
            Ok(process) => {
                *entry.process.lock().await = Some(process);
                entry.mark_started();
                entry.set_last_error(None);
                self.transition(&entry, ModelState::Ready);
                counter!("llamagate_model_reloads_total", "model" => name.to_string())
                    .increment(1);
                entry.queue.drain_ready();
                Ok(VerbOutcome::Reloaded)
            }
            Err(e) => {
                let reason = e.to_string();
                entry.set_last_error(Some(reason.clone()));
                entry.mark_stopped();
                self.transition(&entry, ModelState::Failed);
                entry.queue.fail_all(|| GatewayError::StartFailure {
                    model: name.to_string(),
                    reason: reason.clone(),
                });
                Err(e)
            }
        }
    }

    /// Claim a concurrency slot for `entry`, evicting lower-priority
    /// Ready models if needed. On success the entry is Starting.
    async fn admit(&self, entry: &Arc<ModelEntry>) -> Result<(), GatewayError> {
        loop {
            let victim = {
                let _g = self.inner.admission.lock().await;
                if self.inner.registry.occupied_count() < self.inner.settings.max_concurrent_models
                {
                    self.transition(entry, ModelState::Starting);
                    return Ok(());
                }
                match self.pick_victim(&entry.name) {
                    Some(victim) => {
                        // Reserve the victim under the admission lock so
                        // concurrent admitters neither count it as Ready
                        // nor pick it twice.
                        self.transition(&victim, ModelState::Stopping);
                        victim
                    }
                    None => {
                        counter!("llamagate_admission_denied_total").increment(1);
                        return Err(GatewayError::AdmissionDenied(entry.name.clone()));
                    }
                }
            };

            info!(
                model = %entry.name,
                victim = %victim.name,
                victim_priority = victim.config().priority,
                "Evicting idle model to admit start"
            );
            counter!("llamagate_evictions_total", "model" => victim.name.clone()).increment(1);

            let _vt = victim.transition.lock().await;
            self.stop_locked(&victim).await;
            // Loop to contend for the slot the eviction freed.
        }
    }

    /// Eviction candidate: Ready, not preloaded, lowest priority first,
    /// oldest activity breaking ties.
    fn pick_victim(&self, requester: &str) -> Option<Arc<ModelEntry>> {
        self.inner
            .registry
            .entries()
            .into_iter()
            .filter(|e| {
                e.name != requester && e.state() == ModelState::Ready && !e.config().preload
            })
            .min_by_key(|e| (e.config().priority, e.last_activity_ms().unwrap_or(0)))
    }

    /// Record the outcome of one forward; demote to Failed after the
    /// threshold of consecutive transport failures.
    pub fn note_transport_result(&self, entry: &Arc<ModelEntry>, ok: bool) {
        let streak = entry.record_transport_result(ok);
        if !ok && streak >= TRANSPORT_FAILURE_THRESHOLD {
            warn!(
                model = %entry.name,
                streak,
                "Consecutive transport failures, demoting backend"
            );
            let controller = self.clone();
            let entry = Arc::clone(entry);
            tokio::spawn(async move {
                controller.demote_failed(&entry).await;
            });
        }
    }

    async fn demote_failed(&self, entry: &Arc<ModelEntry>) {
        let _t = entry.transition.lock().await;
        if entry.state() != ModelState::Ready {
            return;
        }
        self.transition(entry, ModelState::Stopping);
        let process = entry.process.lock().await.take();
        if let Some(process) = process {
            self.inner.supervisor.shutdown(&entry.name, process).await;
        }
        entry.mark_stopped();
        entry.set_last_error(Some(format!(
            "{} consecutive transport failures",
            TRANSPORT_FAILURE_THRESHOLD
        )));
        self.transition(entry, ModelState::Failed);
    }

    /// Stop Ready, non-preloaded models idle beyond the threshold.
    /// Called by the reaper task; safe to run concurrently with any
    /// other transition thanks to per-model serialization.
    pub async fn reap_idle(&self) {
        for entry in self.inner.registry.entries() {
            if entry.state() != ModelState::Ready || entry.config().preload {
                continue;
            }
            let Some(idle) = entry.idle_for() else {
                continue;
            };
            if idle > self.inner.settings.idle_timeout {
                info!(
                    model = %entry.name,
                    idle_secs = idle.as_secs(),
                    "Stopping idle model"
                );
                counter!("llamagate_reaped_total", "model" => entry.name.clone()).increment(1);
                if let Err(e) = self.stop_model(&entry.name).await {
                    warn!(model = %entry.name, error = %e, "Idle stop failed");
                }
            }
        }
    }

    /// Resolve expired queue waiters with 504. Called periodically.
    pub fn sweep_queues(&self) {
        for entry in self.inner.registry.entries() {
            let expired = entry.queue.sweep_expired();
            if expired > 0 {
                debug!(model = %entry.name, expired, "Timed out queued requests");
                counter!("llamagate_queue_timeouts_total", "model" => entry.name.clone())
                    .increment(expired as u64);
            }
        }
    }

    /// Boot sequence: preloaded models first (always), then auto-start
    /// models unless running on-demand only. Priority-descending within
    /// each group; failures are logged, never fatal.
    pub async fn bootstrap(&self) {
        let mut entries = self.inner.registry.entries();
        entries.sort_by_key(|e| std::cmp::Reverse(e.config().priority));

        for entry in entries.iter().filter(|e| e.config().preload) {
            info!(model = %entry.name, "Preloading model");
            if let Err(e) = self.start_model(&entry.name).await {
                warn!(model = %entry.name, error = %e, "Preload failed");
            }
        }

        if self.inner.settings.on_demand_only {
            return;
        }

        for entry in entries
            .iter()
            .filter(|e| e.config().auto_start && !e.config().preload)
        {
            info!(model = %entry.name, priority = entry.config().priority, "Auto-starting model");
            if let Err(e) = self.start_model(&entry.name).await {
                warn!(model = %entry.name, error = %e, "Auto-start failed");
            }
        }
    }

    /// Start every configured model, priority-descending so admission
    /// pressure evicts the least important ones last.
    pub async fn start_all(&self) -> BTreeMap<String, bool> {
        let mut entries = self.inner.registry.entries();
        entries.sort_by_key(|e| std::cmp::Reverse(e.config().priority));

        let mut results = BTreeMap::new();
        for entry in entries {
            let ok = self.start_model(&entry.name).await.is_ok();
            results.insert(entry.name.clone(), ok);
        }
        results
    }

    /// Stop every model except preloaded ones (reported as `false`).
    /// Parallel fan-out; partial failure does not abort the rest.
    pub async fn stop_all(&self) -> BTreeMap<String, bool> {
        let tasks = self
            .inner
            .registry
            .entries()
            .into_iter()
            .map(|entry| async move {
                if entry.config().preload {
                    warn!(model = %entry.name, "Skipping preloaded model in stop-all");
                    return (entry.name.clone(), false);
                }
                let ok = self.stop_model(&entry.name).await.is_ok();
                (entry.name.clone(), ok)
            });
        join_all(tasks).await.into_iter().collect()
    }

    /// Restart every currently running model, in parallel.
    pub async fn restart_all(&self) -> BTreeMap<String, bool> {
        let running: Vec<_> = self
            .inner
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.state() == ModelState::Ready)
            .collect();

        let tasks = running.into_iter().map(|entry| async move {
            let ok = self.stop_model(&entry.name).await.is_ok()
                && self.start_model(&entry.name).await.is_ok();
            (entry.name.clone(), ok)
        });
        join_all(tasks).await.into_iter().collect()
    }

    /// Start every model in a resource group, priority-descending.
    pub async fn start_group(&self, group: &str) -> BTreeMap<String, bool> {
        let mut entries: Vec<_> = self
            .inner
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.config().resource_group == group)
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.config().priority));

        let mut results = BTreeMap::new();
        for entry in entries {
            let ok = self.start_model(&entry.name).await.is_ok();
            results.insert(entry.name.clone(), ok);
        }
        results
    }

    /// Stop every model in a resource group, skipping preloaded ones.
    pub async fn stop_group(&self, group: &str) -> BTreeMap<String, bool> {
        let members: Vec<_> = self
            .inner
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.config().resource_group == group)
            .collect();

        let tasks = members.into_iter().map(|entry| async move {
            if entry.config().preload {
                warn!(model = %entry.name, group = %group, "Skipping preloaded model in group stop");
                return (entry.name.clone(), false);
            }
            let ok = self.stop_model(&entry.name).await.is_ok();
            (entry.name.clone(), ok)
        });
        join_all(tasks).await.into_iter().collect()
    }

    /// Rollup of every resource group.
    pub fn group_status(&self) -> BTreeMap<String, GroupStatus> {
        let mut groups: BTreeMap<String, GroupStatus> = BTreeMap::new();
        for entry in self.inner.registry.entries() {
            let config = entry.config();
            let group = groups
                .entry(config.resource_group.clone())
                .or_insert_with(|| GroupStatus {
                    total_models: 0,
                    running_models: 0,
                    models: Vec::new(),
                });
            group.total_models += 1;
            if entry.state() == ModelState::Ready {
                group.running_models += 1;
            }
            group.models.push(entry.name.clone());
        }
        for group in groups.values_mut() {
            group.models.sort();
        }
        groups
    }

    /// Apply a new `models:` snapshot: create added entries, drive
    /// removed ones to Stopped and delete them, respawn entries whose
    /// launch parameters changed, update the rest in place. A model
    /// whose config is unchanged is never touched.
    pub async fn apply_model_configs(
        &self,
        new_models: HashMap<String, ModelConfig>,
    ) -> ReloadReport {
        let mut report = ReloadReport::default();

        for entry in self.inner.registry.entries() {
            if !new_models.contains_key(&entry.name) {
                info!(model = %entry.name, "Removing model dropped from configuration");
                if let Err(e) = self.stop_model(&entry.name).await {
                    warn!(model = %entry.name, error = %e, "Stop during removal failed");
                }
                entry.queue.clear();
                self.inner.registry.remove(&entry.name);
                report.removed.push(entry.name.clone());
            }
        }

        for (name, new_config) in new_models {
            let Some(entry) = self.inner.registry.get(&name) else {
                info!(model = %name, "Adding model from configuration");
                self.inner.registry.insert(new_config.clone());
                report.added.push(name.clone());
                if new_config.preload
                    || (new_config.auto_start && !self.inner.settings.on_demand_only)
                {
                    if let Err(e) = self.start_model(&name).await {
                        warn!(model = %name, error = %e, "Start of added model failed");
                    }
                }
                continue;
            };

            let old_config = entry.config();
            if *old_config == new_config {
                continue;
            }

            if old_config.requires_restart(&new_config) {
                let was_running = entry.state().is_active();
                info!(model = %name, was_running, "Model launch parameters changed, respawning");
                if let Err(e) = self.stop_model(&name).await {
                    warn!(model = %name, error = %e, "Stop during reconfigure failed");
                }
                entry.set_config(new_config);
                if was_running {
                    if let Err(e) = self.start_model(&name).await {
                        warn!(model = %name, error = %e, "Restart after reconfigure failed");
                    }
                }
                report.restarted.push(name);
            } else {
                debug!(model = %name, "Updating model configuration in place");
                entry.set_config(new_config);
                report.updated.push(name);
            }
        }

        report.added.sort();
        report.removed.sort();
        report.restarted.sort();
        report.updated.sort();
        report
    }

    /// Stop everything, preloaded models included. Used at shutdown so
    /// no child outlives the gateway.
    pub async fn shutdown_all(&self) {
        info!("Stopping all backends");
        let tasks = self
            .inner
            .registry
            .entries()
            .into_iter()
            .map(|entry| async move {
                let _ = self.stop_model(&entry.name).await;
            });
        join_all(tasks).await;
    }
}
