//! Token keep-alive: probe immediately on start, then on a fixed interval.
//! Failures are reported and logged but never stop the schedule. The task is
//! aborted on stop or drop so the timer cannot outlive its owner.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The refresh action, e.g. "run the CLI once so the OAuth token refreshes".
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Error callback; invoked with the failure message on each failed probe.
pub type KeepAliveErrorFn = Arc<dyn Fn(String) + Send + Sync>;

pub struct TokenKeepAlive {
    interval: Duration,
    refresh: RefreshFn,
    on_refresh: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<KeepAliveErrorFn>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokenKeepAlive {
    pub fn new(
        interval: Duration,
        refresh: RefreshFn,
        on_refresh: Option<Arc<dyn Fn() + Send + Sync>>,
        on_error: Option<KeepAliveErrorFn>,
    ) -> Self {
        Self {
            interval,
            refresh,
            on_refresh,
            on_error,
            handle: Mutex::new(None),
        }
    }

    async fn probe(&self) {
        match (self.refresh)().await {
            Ok(()) => {
                debug!("token keep-alive probe succeeded");
                if let Some(on_refresh) = &self.on_refresh {
                    on_refresh();
                }
            }
            Err(message) => {
                warn!(%message, "token keep-alive probe failed");
                if let Some(on_error) = &self.on_error {
                    on_error(message);
                }
            }
        }
    }

    /// Probes once immediately, then every interval. A second start replaces
    /// the running task.
    pub async fn start(self: &Arc<Self>) {
        let keepalive = self.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            keepalive.probe().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate tick already covered by the probe
            loop {
                ticker.tick().await;
                keepalive.probe().await;
            }
        });
        if let Some(previous) = self.handle.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub async fn stop(&self) {
        if let Some(task) = self.handle.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for TokenKeepAlive {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.handle.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
