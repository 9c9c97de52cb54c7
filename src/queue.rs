//! Per-model request queue.
//!
//! Requests that arrive while a model is not ready are parked here as
//! oneshot waiters and resolved in FIFO order when the model becomes
//! ready (or all at once when the start fails, the queue is cleared, or
//! a waiter exceeds its timeout). A waiter whose receiver has been
//! dropped is a cancelled client and is skipped silently.

use crate::error::GatewayError;
use metrics::gauge;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Resolved queue limits for one model (per-model override or gateway
/// default).
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub capacity: usize,
    pub request_timeout: Duration,
}

/// What a parked request awaits.
pub type ReadyReceiver = oneshot::Receiver<Result<(), GatewayError>>;

struct Waiter {
    enqueued_at: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Result<(), GatewayError>>,
}

/// Bounded FIFO of requests waiting for one model.
pub struct RequestQueue {
    model: String,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl RequestQueue {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Park a request. Fails immediately with `QueueFull` at capacity.
    pub fn enqueue(&self, settings: &QueueSettings) -> Result<ReadyReceiver, GatewayError> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.len() >= settings.capacity {
            return Err(GatewayError::QueueFull(self.model.clone()));
        }

        let (tx, rx) = oneshot::channel();
        waiters.push_back(Waiter {
            enqueued_at: Instant::now(),
            timeout: settings.request_timeout,
            tx,
        });
        self.record_depth(waiters.len());
        Ok(rx)
    }

    /// Release every waiter in FIFO order. Returns how many live waiters
    /// were released (cancelled clients are dropped, not counted).
    pub fn drain_ready(&self) -> usize {
        self.resolve_all(|| Ok(()))
    }

    /// Resolve every waiter with an error produced by `make_err`.
    pub fn fail_all(&self, make_err: impl Fn() -> GatewayError) -> usize {
        self.resolve_all(|| Err(make_err()))
    }

    /// Operator recovery: resolve every waiter with 503 "queue cleared".
    pub fn clear(&self) -> usize {
        let model = self.model.clone();
        self.resolve_all(move || Err(GatewayError::QueueCleared(model.clone())))
    }

    /// Remove waiters older than their timeout, resolving each with 504.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().unwrap();
            let mut kept = VecDeque::with_capacity(waiters.len());
            let mut expired = Vec::new();
            for waiter in waiters.drain(..) {
                if now.duration_since(waiter.enqueued_at) > waiter.timeout {
                    expired.push(waiter);
                } else {
                    kept.push_back(waiter);
                }
            }
            *waiters = kept;
            self.record_depth(waiters.len());
            expired
        };

        let count = expired.len();
        for waiter in expired {
            let _ = waiter
                .tx
                .send(Err(GatewayError::QueueTimeout(self.model.clone())));
        }
        count
    }

    pub fn depth(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    fn resolve_all(&self, result: impl Fn() -> Result<(), GatewayError>) -> usize {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().unwrap();
            let drained = waiters.drain(..).collect();
            self.record_depth(0);
            drained
        };

        let mut resolved = 0;
        for waiter in drained {
            if waiter.tx.send(result()).is_ok() {
                resolved += 1;
            }
        }
        resolved
    }

    fn record_depth(&self, depth: usize) {
        gauge!("llamagate_queue_depth", "model" => self.model.clone()).set(depth as f64);
    }
}
