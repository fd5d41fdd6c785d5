//! SQLite-backed schedule store: durable schedule definitions + execution logs.
//!
//! One database owned by this crate, independent of the memory database.
//! Booleans are stored as 0/1 and timestamps as milliseconds since the Unix
//! epoch. Deleting a schedule cascades to its logs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("schedule not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

/// Execution status of one log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => LogStatus::Running,
            "success" => LogStatus::Success,
            _ => LogStatus::Failed,
        }
    }
}

/// A durable schedule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`ScheduleStore::create_job`]. When `id` is `None` a v4 uuid is
/// generated.
#[derive(Debug, Clone, Default)]
pub struct NewSchedule {
    pub id: Option<String>,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub enabled: bool,
}

/// Partial update for [`ScheduleStore::update_job`]. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub prompt: Option<String>,
    pub enabled: Option<bool>,
}

/// One execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleLog {
    pub id: i64,
    pub schedule_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: LogStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// SQLite-backed schedule store. Own DB file, single connection behind a mutex;
/// blocking calls are issued via `block_in_place` so async callers stay safe.
pub struct ScheduleStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl ScheduleStore {
    /// Opens or creates the database and tables. Enables foreign keys so that
    /// schedule deletion cascades to logs.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path.as_ref())?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron TEXT NOT NULL,
                prompt TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run INTEGER,
                next_run INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules(enabled);
            CREATE TABLE IF NOT EXISTS schedule_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_schedule_logs_started_at ON schedule_logs(started_at DESC);
            "#,
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            f(&conn)
        })
    }

    /// Creates a schedule. Returns the stored row.
    pub async fn create_job(&self, new: NewSchedule) -> Result<Schedule, StoreError> {
        let id = new
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let created_at = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schedules (id, name, cron, prompt, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id,
                    new.name,
                    new.cron,
                    new.prompt,
                    new.enabled as i64,
                    to_ms(created_at)
                ],
            )?;
            Ok(())
        })?;
        self.get_job(&id).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Schedule, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, cron, prompt, enabled, last_run, next_run, created_at
                 FROM schedules WHERE id = ?1",
                rusqlite::params![id],
                row_to_schedule,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(id.clone()),
                other => other.into(),
            })
        })
    }

    pub async fn list_jobs(&self) -> Result<Vec<Schedule>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, cron, prompt, enabled, last_run, next_run, created_at
                 FROM schedules ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_schedule)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub async fn list_enabled_jobs(&self) -> Result<Vec<Schedule>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, cron, prompt, enabled, last_run, next_run, created_at
                 FROM schedules WHERE enabled = 1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_schedule)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    /// Applies a partial update. Returns the updated row.
    pub async fn update_job(&self, id: &str, update: ScheduleUpdate) -> Result<Schedule, StoreError> {
        let current = self.get_job(id).await?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE schedules SET name = ?2, cron = ?3, prompt = ?4, enabled = ?5 WHERE id = ?1",
                rusqlite::params![
                    id,
                    update.name.unwrap_or(current.name),
                    update.cron.unwrap_or(current.cron),
                    update.prompt.unwrap_or(current.prompt),
                    update.enabled.unwrap_or(current.enabled) as i64,
                ],
            )?;
            Ok(())
        })?;
        self.get_job(id).await
    }

    /// Stamps the scheduler's computed next run (or clears it when disabled).
    pub async fn set_next_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE schedules SET next_run = ?2 WHERE id = ?1",
                rusqlite::params![id, next_run.map(to_ms)],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(id.clone()));
            }
            Ok(())
        })
    }

    /// Deletes a schedule; its logs go with it.
    pub async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM schedules WHERE id = ?1", rusqlite::params![id])?;
            if n == 0 {
                return Err(StoreError::NotFound(id.clone()));
            }
            Ok(())
        })
    }

    /// Opens a `running` log row and stamps the schedule's `last_run`.
    /// Returns the log id for [`ScheduleStore::log_finish`].
    pub async fn log_start(&self, schedule_id: &str) -> Result<i64, StoreError> {
        let schedule_id = schedule_id.to_string();
        let now = Utc::now();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE schedules SET last_run = ?2 WHERE id = ?1",
                rusqlite::params![schedule_id, to_ms(now)],
            )?;
            conn.execute(
                "INSERT INTO schedule_logs (schedule_id, started_at, status) VALUES (?1, ?2, 'running')",
                rusqlite::params![schedule_id, to_ms(now)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Finalizes a log row opened by [`ScheduleStore::log_start`].
    pub async fn log_finish(
        &self,
        log_id: i64,
        status: LogStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE schedule_logs SET finished_at = ?2, status = ?3, output = ?4, error = ?5
                 WHERE id = ?1",
                rusqlite::params![log_id, to_ms(now), status.as_str(), output, error],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("log {log_id}")));
            }
            Ok(())
        })
    }

    pub async fn get_log(&self, log_id: i64) -> Result<ScheduleLog, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, schedule_id, started_at, finished_at, status, output, error
                 FROM schedule_logs WHERE id = ?1",
                rusqlite::params![log_id],
                row_to_log,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("log {log_id}")),
                other => other.into(),
            })
        })
    }

    /// Most recent logs for one schedule, newest first.
    pub async fn get_logs(
        &self,
        schedule_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ScheduleLog>, StoreError> {
        let schedule_id = schedule_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, schedule_id, started_at, finished_at, status, output, error
                 FROM schedule_logs WHERE schedule_id = ?1
                 ORDER BY started_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![schedule_id, limit as i64, offset as i64],
                row_to_log,
            )?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub async fn get_last_execution(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ScheduleLog>, StoreError> {
        Ok(self.get_logs(schedule_id, 1, 0).await?.into_iter().next())
    }

    pub async fn get_last_execution_global(&self) -> Result<Option<ScheduleLog>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, schedule_id, started_at, finished_at, status, output, error
                 FROM schedule_logs ORDER BY started_at DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map([], row_to_log)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    /// Marks every `running` log row as failed. A running row seen at startup
    /// belongs to a previous process that did not live to finalize it.
    pub async fn finalize_orphans(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE schedule_logs SET status = 'failed', finished_at = ?1,
                 error = 'orphaned by restart' WHERE status = 'running'",
                rusqlite::params![to_ms(now)],
            )?;
            Ok(n)
        })
    }
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> Result<Schedule, rusqlite::Error> {
    let enabled: i64 = row.get(4)?;
    let last_run: Option<i64> = row.get(5)?;
    let next_run: Option<i64> = row.get(6)?;
    let created_at: i64 = row.get(7)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        prompt: row.get(3)?,
        enabled: enabled != 0,
        last_run: last_run.map(from_ms),
        next_run: next_run.map(from_ms),
        created_at: from_ms(created_at),
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> Result<ScheduleLog, rusqlite::Error> {
    let started_at: i64 = row.get(2)?;
    let finished_at: Option<i64> = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(ScheduleLog {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        started_at: from_ms(started_at),
        finished_at: finished_at.map(from_ms),
        status: LogStatus::from_str(&status),
        output: row.get(5)?,
        error: row.get(6)?,
    })
}
