//! Heartbeat: periodic self-poll with quiet hours and a notification hook.
//!
//! Each tick outside quiet hours runs the agent with a fixed meta-prompt; the
//! agent answers with `HEARTBEAT_OK`, `NOTIFY: <message>`, or
//! `DONE: <summary>`. Quiet hours may wrap midnight (e.g. 23–7).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::gateway::GatewaySender;

/// The fixed meta-prompt sent on every tick.
pub const HEARTBEAT_PROMPT: &str = "\
Heartbeat check. Review your pending work, scheduled tasks, and anything a \
user asked you to watch. Reply with exactly one of:\n\
- HEARTBEAT_OK — nothing needs attention\n\
- NOTIFY: <message> — something needs the user's attention now\n\
- DONE: <summary> — a background task finished since the last heartbeat";

/// Parsed heartbeat reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    Notify(String),
    Done(String),
    /// Anything off-protocol; logged and otherwise ignored.
    Other(String),
}

impl HeartbeatOutcome {
    pub fn parse(response: &str) -> Self {
        let trimmed = response.trim();
        if trimmed.starts_with("HEARTBEAT_OK") {
            return HeartbeatOutcome::Ok;
        }
        if let Some(message) = trimmed.strip_prefix("NOTIFY:") {
            return HeartbeatOutcome::Notify(message.trim().to_string());
        }
        if let Some(summary) = trimmed.strip_prefix("DONE:") {
            return HeartbeatOutcome::Done(summary.trim().to_string());
        }
        HeartbeatOutcome::Other(trimmed.to_string())
    }
}

/// True when `hour` falls inside the quiet window. `start == end` means no
/// quiet hours; `start > end` wraps midnight.
pub fn in_quiet_hours(hour: u32, quiet_start: u32, quiet_end: u32) -> bool {
    if quiet_start == quiet_end {
        return false;
    }
    if quiet_start < quiet_end {
        (quiet_start..quiet_end).contains(&hour)
    } else {
        hour >= quiet_start || hour < quiet_end
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    /// Local hour [0, 24) when quiet hours begin.
    pub quiet_start: u32,
    /// Local hour [0, 24) when quiet hours end.
    pub quiet_end: u32,
    pub notify_channel_id: Option<String>,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            quiet_start: 23,
            quiet_end: 7,
            notify_channel_id: None,
        }
    }
}

/// Runs the heartbeat prompt through the agent. The callback owns the whole
/// turn (session, lane, backend); the scheduler only times it.
pub type HeartbeatRunner =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, AgentError>> + Send + Sync>;

pub struct HeartbeatScheduler {
    runner: HeartbeatRunner,
    options: HeartbeatOptions,
    notifier: Option<Arc<dyn GatewaySender>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatScheduler {
    pub fn new(
        runner: HeartbeatRunner,
        options: HeartbeatOptions,
        notifier: Option<Arc<dyn GatewaySender>>,
    ) -> Self {
        Self {
            runner,
            options,
            notifier,
            handle: Mutex::new(None),
        }
    }

    /// One tick: skip in quiet hours, otherwise run and act on the reply.
    pub async fn tick(&self) -> Option<HeartbeatOutcome> {
        let hour = Local::now().hour();
        if in_quiet_hours(hour, self.options.quiet_start, self.options.quiet_end) {
            debug!(hour, "heartbeat suppressed by quiet hours");
            return None;
        }
        let response = match (self.runner)(HEARTBEAT_PROMPT.to_string()).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "heartbeat run failed");
                return None;
            }
        };
        let outcome = HeartbeatOutcome::parse(&response);
        match &outcome {
            HeartbeatOutcome::Ok => debug!("heartbeat ok"),
            HeartbeatOutcome::Notify(message) => {
                info!(%message, "heartbeat notification");
                if let (Some(notifier), Some(channel)) =
                    (&self.notifier, &self.options.notify_channel_id)
                {
                    if let Err(e) = notifier.send(channel, message).await {
                        warn!(error = %e, "heartbeat notify failed");
                    }
                }
            }
            HeartbeatOutcome::Done(summary) => info!(%summary, "heartbeat task done"),
            HeartbeatOutcome::Other(text) => warn!(%text, "heartbeat reply off-protocol"),
        }
        Some(outcome)
    }

    /// Spawns the periodic loop. Idempotent: a second start replaces the
    /// previous task.
    pub async fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let interval = self.options.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so the agent
            // is not polled the instant the process boots.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.tick().await;
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
