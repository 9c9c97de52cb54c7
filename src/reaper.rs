//! Background sweepers: idle reaping, queue timeout sweeps, and the
//! periodic status snapshot.
//!
//! Each runs on its own interval with `MissedTickBehavior::Skip` so a
//! slow sweep never causes a burst of catch-up ticks. The actual work is
//! delegated to the controller, whose per-model serialization makes the
//! sweeps safe to fire while other transitions are in flight.

use crate::lifecycle::Controller;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Stop non-preloaded Ready models that have sat idle too long.
pub fn spawn_idle_reaper(controller: Controller, interval: Duration) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Spawning idle reaper");
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            controller.reap_idle().await;
        }
    })
}

/// Resolve queued requests that outlived their timeout with 504.
pub fn spawn_queue_sweeper(controller: Controller, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            controller.sweep_queues();
        }
    })
}

/// Publish a full status snapshot on the status channel.
pub fn spawn_status_ticker(controller: Controller, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let snapshot = controller.registry().status_all();
            controller.status_hub().publish_snapshot(snapshot);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::LifecycleSettings;
    use crate::queue::QueueSettings;
    use crate::registry::{ModelState, Registry};
    use crate::status::{StatusEvent, StatusHub};
    use crate::supervisor::{Supervisor, SupervisorSettings};
    use std::sync::Arc;

    fn quick_controller(idle_timeout: Duration) -> Controller {
        let config = Config::from_yaml(
            r#"
models:
  sleepy:
    port: 18301
    model_path: /s.gguf
"#,
        )
        .unwrap();
        let registry = Arc::new(Registry::new(
            config.models,
            QueueSettings {
                capacity: 10,
                request_timeout: Duration::from_millis(50),
            },
        ));
        let supervisor = Supervisor::new(SupervisorSettings {
            command: "llamagate-test-no-such-binary".to_string(),
            health_path: "/health".to_string(),
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            start_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(100),
            log_tail_lines: 10,
        });
        Controller::new(
            registry,
            supervisor,
            StatusHub::default(),
            LifecycleSettings {
                max_concurrent_models: 2,
                idle_timeout,
                on_demand_only: false,
                stop_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn test_idle_reaper_stops_idle_model() {
        let controller = quick_controller(Duration::from_millis(20));
        let entry = controller.registry().get("sleepy").unwrap();
        entry.set_state(ModelState::Ready);
        entry.touch();

        let handle = spawn_idle_reaper(controller.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert_eq!(entry.state(), ModelState::Stopped);
    }

    #[tokio::test]
    async fn test_queue_sweeper_times_out_waiters() {
        let controller = quick_controller(Duration::from_secs(300));
        let entry = controller.registry().get("sleepy").unwrap();
        let settings = controller.registry().queue_settings(&entry);
        let rx = entry.queue.enqueue(&settings).unwrap();

        let handle = spawn_queue_sweeper(controller.clone(), Duration::from_millis(20));
        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("sweeper never fired")
            .unwrap();
        handle.abort();

        assert!(matches!(
            result.unwrap_err(),
            crate::error::GatewayError::QueueTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_status_ticker_publishes_snapshots() {
        let controller = quick_controller(Duration::from_secs(300));
        let mut rx = controller.status_hub().subscribe();

        let handle = spawn_status_ticker(controller.clone(), Duration::from_millis(20));
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no snapshot published")
            .unwrap();
        handle.abort();

        match event {
            StatusEvent::Snapshot { models, .. } => {
                assert!(models.contains_key("sleepy"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
