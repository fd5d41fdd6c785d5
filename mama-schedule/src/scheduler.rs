//! Timer-driven cron scheduler: one timer task per enabled job, single-flight
//! execution through [`JobLock`], lifecycle events on every edge.
//!
//! The scheduler owns the authoritative runtime map; the optional
//! [`ScheduleStore`] is kept in sync (last_run/next_run, execution logs) but
//! never consulted on the hot path. Job state machine per job:
//! Disabled ⇄ Idle → Running → Idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cron::{detect_system_timezone, CronError, CronExpr};
use crate::lock::JobLock;
use crate::store::{LogStatus, ScheduleStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error("job already exists: {0}")]
    JobExists(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Scheduler-wide options.
#[derive(Clone)]
pub struct SchedulerOptions {
    /// Timezone for next-run computation. Defaults to the host timezone, UTC
    /// when undetectable.
    pub timezone: Tz,
    /// When true, recovery fires one coalesced catch-up run for each job whose
    /// stored next run elapsed while the process was down.
    pub run_missed_on_startup: bool,
    /// Maximum number of jobs executing at once across the scheduler.
    pub max_concurrent: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            timezone: detect_system_timezone().unwrap_or(chrono_tz::UTC),
            run_missed_on_startup: false,
            max_concurrent: 1,
        }
    }
}

/// Definition of one job as registered with the scheduler.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub enabled: bool,
}

/// What the execute callback receives.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: String,
    pub name: String,
    pub prompt: String,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl JobResult {
    fn skipped() -> Self {
        Self {
            success: false,
            output: None,
            error: Some("Job is already running".to_string()),
            duration: Duration::ZERO,
        }
    }
}

/// Lifecycle events, one per state-machine edge.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { id: String },
    Completed { id: String, duration: Duration },
    Failed { id: String, duration: Duration, error: String },
    Skipped { id: String },
}

/// Execute callback: runs the job's prompt, returns output text or an error
/// message. Registered once at construction.
pub type ExecuteFn = Arc<dyn Fn(JobRun) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Event handler invoked on every lifecycle edge.
pub type EventFn = Arc<dyn Fn(JobEvent) + Send + Sync>;

/// Runtime projection of a job, as reported by `get_job`/`list_jobs`.
#[derive(Debug, Clone)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub enabled: bool,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_result: Option<JobResult>,
}

struct Job {
    config: JobConfig,
    expr: CronExpr,
    timer: Option<JoinHandle<()>>,
    is_running: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    last_result: Option<JobResult>,
}

impl Job {
    fn projection(&self) -> CronJob {
        CronJob {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            cron: self.config.cron.clone(),
            prompt: self.config.prompt.clone(),
            enabled: self.config.enabled,
            is_running: self.is_running,
            last_run: self.last_run,
            next_run: self.next_run,
            last_result: self.last_result.clone(),
        }
    }
}

struct Inner {
    jobs: Mutex<HashMap<String, Job>>,
    lock: JobLock,
    execute: ExecuteFn,
    on_event: Option<EventFn>,
    store: Option<Arc<ScheduleStore>>,
    options: SchedulerOptions,
    gate: Semaphore,
}

impl Inner {
    fn emit(&self, event: JobEvent) {
        if let Some(handler) = &self.on_event {
            handler(event);
        }
    }
}

/// Cron scheduler. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl CronScheduler {
    pub fn new(
        execute: ExecuteFn,
        on_event: Option<EventFn>,
        store: Option<Arc<ScheduleStore>>,
        options: SchedulerOptions,
    ) -> Self {
        let gate = Semaphore::new(options.max_concurrent.max(1));
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                lock: JobLock::new(),
                execute,
                on_event,
                store,
                options,
                gate,
            }),
        }
    }

    /// Registers a job. Validates the cron expression, rejects duplicate ids,
    /// computes the first next-run, and installs a timer when enabled.
    pub async fn add_job(&self, config: JobConfig) -> Result<CronJob, SchedulerError> {
        let expr = CronExpr::parse(&config.cron)?;
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&config.id) {
            return Err(SchedulerError::JobExists(config.id));
        }
        let next_run = config
            .enabled
            .then(|| self.calculate_next_run(&config.cron))
            .flatten();
        let mut job = Job {
            expr,
            timer: None,
            is_running: false,
            last_run: None,
            next_run,
            last_result: None,
            config,
        };
        if job.config.enabled {
            job.timer = Some(self.spawn_timer(job.config.id.clone()));
        }
        let projection = job.projection();
        jobs.insert(job.config.id.clone(), job);
        Ok(projection)
    }

    /// Stops the timer, releases any held lock, and forgets the job.
    pub async fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs.lock().await;
        let job = jobs
            .remove(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        if let Some(timer) = job.timer {
            timer.abort();
        }
        self.inner.lock.release(id);
        Ok(())
    }

    pub async fn enable_job(&self, id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        if job.config.enabled {
            return Ok(());
        }
        job.config.enabled = true;
        job.next_run = self.calculate_next_run(&job.config.cron);
        job.timer = Some(self.spawn_timer(id.to_string()));
        let next = job.next_run;
        drop(jobs);
        self.sync_next_run(id, next).await;
        Ok(())
    }

    pub async fn disable_job(&self, id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        job.config.enabled = false;
        job.next_run = None;
        if let Some(timer) = job.timer.take() {
            timer.abort();
        }
        drop(jobs);
        self.sync_next_run(id, None).await;
        Ok(())
    }

    /// Fires a job immediately through the same path a timer fire takes.
    pub async fn run_now(&self, id: &str) -> Result<JobResult, SchedulerError> {
        {
            let jobs = self.inner.jobs.lock().await;
            if !jobs.contains_key(id) {
                return Err(SchedulerError::JobNotFound(id.to_string()));
            }
        }
        Ok(self.execute_job(id).await)
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        self.inner.jobs.lock().await.get(id).map(Job::projection)
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.inner
            .jobs
            .lock()
            .await
            .values()
            .map(Job::projection)
            .collect()
    }

    /// Next fire time for an expression in the configured timezone. Falls back
    /// to one year out on parse failure so a bad edit keeps the scheduler
    /// advancing instead of wedging it.
    pub fn calculate_next_run(&self, cron: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        match CronExpr::parse(cron) {
            Ok(expr) => expr
                .next_after(now, self.inner.options.timezone)
                .or_else(|| Some(now + chrono::Duration::days(365))),
            Err(e) => {
                warn!(cron, error = %e, "unparseable cron, deferring one year");
                Some(now + chrono::Duration::days(365))
            }
        }
    }

    /// Stops all timers, releases all locks, clears the job map.
    pub async fn shutdown(&self) {
        let mut jobs = self.inner.jobs.lock().await;
        for job in jobs.values_mut() {
            if let Some(timer) = job.timer.take() {
                timer.abort();
            }
        }
        jobs.clear();
        self.inner.lock.release_all();
    }

    /// Startup recovery: finalize orphaned `running` logs, re-register every
    /// enabled schedule, and sync each computed next-run back to the store.
    /// When `run_missed_on_startup` is set, a schedule whose stored next-run
    /// elapsed during downtime gets one coalesced catch-up fire.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let store = match &self.inner.store {
            Some(s) => s.clone(),
            None => return Ok(0),
        };
        let orphans = store.finalize_orphans().await?;
        if orphans > 0 {
            warn!(orphans, "finalized orphaned execution logs");
        }
        let schedules = store.list_enabled_jobs().await?;
        let mut recovered = 0usize;
        for schedule in schedules {
            let missed = self.inner.options.run_missed_on_startup
                && schedule.next_run.is_some_and(|t| t < Utc::now());
            let added = self
                .add_job(JobConfig {
                    id: schedule.id.clone(),
                    name: schedule.name.clone(),
                    cron: schedule.cron.clone(),
                    prompt: schedule.prompt.clone(),
                    enabled: true,
                })
                .await;
            match added {
                Ok(job) => {
                    store.set_next_run(&schedule.id, job.next_run).await?;
                    recovered += 1;
                    if missed {
                        debug!(id = %schedule.id, "running missed schedule once");
                        let _ = self.execute_job(&schedule.id).await;
                    }
                }
                Err(e) => warn!(id = %schedule.id, error = %e, "skipping unrecoverable schedule"),
            }
        }
        Ok(recovered)
    }

    fn spawn_timer(&self, id: String) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let jobs = scheduler.inner.jobs.lock().await;
                    match jobs.get(&id) {
                        Some(job) if job.config.enabled => {
                            job.expr.next_after(Utc::now(), scheduler.inner.options.timezone)
                        }
                        _ => return,
                    }
                };
                let Some(next) = next else { return };
                {
                    let mut jobs = scheduler.inner.jobs.lock().await;
                    if let Some(job) = jobs.get_mut(&id) {
                        job.next_run = Some(next);
                    }
                }
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                let _ = scheduler.execute_job(&id).await;
            }
        })
    }

    /// The one execution path, shared by timer fires and `run_now`.
    async fn execute_job(&self, id: &str) -> JobResult {
        let inner = &self.inner;
        if !inner.lock.acquire(id, None) {
            inner.emit(JobEvent::Skipped { id: id.to_string() });
            return JobResult::skipped();
        }
        let _release = crate::lock::ReleaseGuard {
            lock: &inner.lock,
            job_id: id.to_string(),
        };
        let _permit = inner.gate.acquire().await.ok();

        let run = {
            let mut jobs = inner.jobs.lock().await;
            let Some(job) = jobs.get_mut(id) else {
                return JobResult {
                    success: false,
                    output: None,
                    error: Some(format!("job not found: {id}")),
                    duration: Duration::ZERO,
                };
            };
            job.is_running = true;
            job.last_run = Some(Utc::now());
            JobRun {
                id: job.config.id.clone(),
                name: job.config.name.clone(),
                prompt: job.config.prompt.clone(),
            }
        };

        inner.emit(JobEvent::Started { id: id.to_string() });
        let log_id = match &inner.store {
            Some(store) => match store.log_start(id).await {
                Ok(log_id) => Some(log_id),
                Err(e) => {
                    warn!(id, error = %e, "log_start failed");
                    None
                }
            },
            None => None,
        };

        let started = Instant::now();
        let outcome = (inner.execute)(run).await;
        let duration = started.elapsed();

        let result = match outcome {
            Ok(output) => {
                inner.emit(JobEvent::Completed {
                    id: id.to_string(),
                    duration,
                });
                JobResult {
                    success: true,
                    output: Some(output),
                    error: None,
                    duration,
                }
            }
            Err(error) => {
                inner.emit(JobEvent::Failed {
                    id: id.to_string(),
                    duration,
                    error: error.clone(),
                });
                JobResult {
                    success: false,
                    output: None,
                    error: Some(error),
                    duration,
                }
            }
        };

        if let (Some(store), Some(log_id)) = (&inner.store, log_id) {
            let status = if result.success {
                LogStatus::Success
            } else {
                LogStatus::Failed
            };
            if let Err(e) = store
                .log_finish(log_id, status, result.output.clone(), result.error.clone())
                .await
            {
                warn!(id, error = %e, "log_finish failed");
            }
        }

        let next_run = {
            let mut jobs = inner.jobs.lock().await;
            match jobs.get_mut(id) {
                Some(job) => {
                    job.is_running = false;
                    job.last_result = Some(result.clone());
                    job.next_run = job
                        .config
                        .enabled
                        .then(|| self.calculate_next_run(&job.config.cron))
                        .flatten();
                    Some(job.next_run)
                }
                None => None,
            }
        };
        if let Some(next) = next_run {
            self.sync_next_run(id, next).await;
        }
        result
    }

    async fn sync_next_run(&self, id: &str, next: Option<DateTime<Utc>>) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.set_next_run(id, next).await {
                debug!(id, error = %e, "next_run sync skipped");
            }
        }
    }
}
