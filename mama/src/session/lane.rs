//! Per-key FIFO lanes. One worker task per channel key drains an unbounded
//! queue; operations sharing a key run strictly in enqueue order, operations
//! on distinct keys run in parallel.
//!
//! Cancellation: a cancelled queued operation never runs; an in-flight
//! operation runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::session::pool::ChannelKey;

struct LaneTask {
    cancelled: Arc<AtomicBool>,
    fut: BoxFuture<'static, ()>,
}

/// Handle to an enqueued operation.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
    cancelled: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    /// Marks the operation cancelled. Queued operations are dropped without
    /// side effects; an operation already running is unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Waits for the result. `None` when the operation was cancelled before it
    /// ran (or its lane shut down).
    pub async fn join(self) -> Option<T> {
        self.rx.await.ok()
    }
}

/// Serialized enqueuing per channel key.
#[derive(Default)]
pub struct LaneManager {
    lanes: DashMap<String, mpsc::UnboundedSender<LaneTask>>,
}

impl LaneManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `f` on the lane for `key`. The returned handle resolves with
    /// the operation's output once it has run.
    pub fn enqueue<T, F, Fut>(&self, key: &ChannelKey, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = LaneTask {
            cancelled: cancelled.clone(),
            fut: Box::pin(async move {
                let out = f().await;
                let _ = tx.send(out);
            }),
        };

        let sender = self
            .lanes
            .entry(key.to_string())
            .or_insert_with(|| {
                let (lane_tx, mut lane_rx) = mpsc::unbounded_channel::<LaneTask>();
                tokio::spawn(async move {
                    while let Some(task) = lane_rx.recv().await {
                        if task.cancelled.load(Ordering::SeqCst) {
                            continue;
                        }
                        task.fut.await;
                    }
                });
                lane_tx
            })
            .clone();

        // A closed lane only happens after shutdown; the handle then resolves
        // to None like a cancellation.
        let _ = sender.send(task);
        TaskHandle { rx, cancelled }
    }

    /// Number of live lanes.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Drops all lane senders; workers exit after draining what they hold.
    pub fn shutdown(&self) {
        self.lanes.clear();
    }
}
