//! Health monitor — background sweeps over the whole fleet.
//!
//! Runs [`EmulatorHealthChecker::check_all`] on a fixed interval, tracks
//! consecutive failures per instance, and invokes a callback once an
//! instance crosses the unhealthy threshold. The pool deliberately hands
//! instances back as-is on release; this monitor is what eventually
//! catches a dirtied or wedged instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checker::EmulatorHealthChecker;

/// Callback invoked with an instance id once it crosses the unhealthy
/// threshold. The pool or scheduler can use this to recycle the instance.
pub type UnhealthyCallback = Arc<dyn Fn(String) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Consecutive failed sweeps before an instance is reported unhealthy.
const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Periodic fleet-wide health sweep.
pub struct HealthMonitor {
    checker: Arc<EmulatorHealthChecker>,
    interval: Duration,
    threshold: u32,
    on_unhealthy: Option<UnhealthyCallback>,
    slot: Mutex<Option<MonitorSlot>>,
}

impl HealthMonitor {
    pub fn new(checker: Arc<EmulatorHealthChecker>, interval: Duration) -> Self {
        Self {
            checker,
            interval,
            threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            on_unhealthy: None,
            slot: Mutex::new(None),
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Set the callback fired when an instance crosses the threshold.
    pub fn with_callback(mut self, callback: UnhealthyCallback) -> Self {
        self.on_unhealthy = Some(callback);
        self
    }

    /// Start the background sweep. Replaces a previously running sweep.
    pub async fn start(&self) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let checker = self.checker.clone();
        let interval = self.interval;
        let threshold = self.threshold;
        let callback = self.on_unhealthy.clone();

        let handle = tokio::spawn(async move {
            let mut tracker = FailureTracker::new(threshold);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let results = checker.check_all().await;
                let seen: Vec<String> = results.iter().map(|r| r.id.clone()).collect();

                for status in results {
                    if tracker.record(&status.id, status.healthy) {
                        warn!(
                            id = %status.id,
                            threshold,
                            error = status.error.as_deref().unwrap_or("unhealthy"),
                            "instance crossed unhealthy threshold"
                        );
                        if let Some(ref callback) = callback {
                            callback(status.id).await;
                        }
                    }
                }
                tracker.retain(&seen);
                debug!(instances = seen.len(), "health sweep complete");
            }
        });

        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.replace(MonitorSlot {
            handle,
            shutdown_tx,
        }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
    }

    /// Stop the background sweep.
    pub async fn stop(&self) {
        if let Some(slot) = self.slot.lock().await.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!("health monitor stopped");
        }
    }
}

/// Tracks consecutive failed checks per instance.
struct FailureTracker {
    threshold: u32,
    failures: HashMap<String, u32>,
}

impl FailureTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: HashMap::new(),
        }
    }

    /// Record one sweep result. Returns true exactly when this failure
    /// crosses the threshold, so the callback fires once per incident.
    fn record(&mut self, id: &str, healthy: bool) -> bool {
        if healthy {
            self.failures.remove(id);
            return false;
        }
        let count = self.failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count == self.threshold
    }

    /// Drop counters for instances no longer in the fleet.
    fn retain(&mut self, seen: &[String]) {
        self.failures.retain(|id, _| seen.iter().any(|s| s == id));
    }
}
