//! Persistent job rows and the fire log.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use uuid::Uuid;

use super::{Database, StoreError};
use crate::types::{FireOutcome, FireRecord, Job, JobId, JobStatus};

const WALL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const JOB_COLUMNS: &str = "id, client_id, schedule_type, cron_expression, time_zone, \
     start_time, next_fire_time, status, run_count, failure_count, last_error, \
     created_at, updated_at";

/// Durable CRUD over job rows. Every method that takes `&self` commits in
/// its own transaction; writes meant to join a caller's transaction go
/// through the `*_in` associated functions inside `Database::in_transaction`.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

/// Aggregate job counts for the health probe.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub scheduling: usize,
    pub scheduled: usize,
    pub running: usize,
    pub paused: usize,
    pub completed_success: usize,
    pub completed_failure: usize,
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a job inside the caller's transaction.
    pub fn insert_in(tx: &Transaction<'_>, job: &Job) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO jobs (id, client_id, schedule_type, cron_expression, time_zone,
                start_time, next_fire_time, status, run_count, failure_count, last_error,
                created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                job.id.to_string(),
                job.client_id,
                job.schedule_kind.to_string(),
                job.cron_expression,
                job.time_zone,
                job.start_time.map(format_wall),
                job.next_fire_time.map(format_wall),
                job.status.to_string(),
                job.run_count as i64,
                job.failure_count as i64,
                job.last_error,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"
                ))?;
                let row = stmt
                    .query_row(params![id.to_string()], row_to_job)
                    .optional()?;
                match row {
                    Some(inner) => Ok(Some(inner?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([], row_to_job)?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row??);
                }
                Ok(jobs)
            })
            .await
    }

    /// Replace every mutable column of a job row in its own transaction.
    pub async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE jobs SET client_id = ?1, schedule_type = ?2, cron_expression = ?3,
                        time_zone = ?4, start_time = ?5, next_fire_time = ?6, status = ?7,
                        run_count = ?8, failure_count = ?9, last_error = ?10, updated_at = ?11
                     WHERE id = ?12",
                    params![
                        job.client_id,
                        job.schedule_kind.to_string(),
                        job.cron_expression,
                        job.time_zone,
                        job.start_time.map(format_wall),
                        job.next_fire_time.map(format_wall),
                        job.status.to_string(),
                        job.run_count as i64,
                        job.failure_count as i64,
                        job.last_error,
                        Utc::now().to_rfc3339(),
                        job.id.to_string(),
                    ],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(job.id));
                }
                Ok(())
            })
            .await
    }

    /// Delete a job row. The trigger row and fire log cascade.
    pub async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])?;
                Ok(rows > 0)
            })
            .await
    }

    /// Set the status in an independent transaction.
    pub async fn update_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.to_string(), Utc::now().to_rfc3339(), id.to_string()],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Set the wall-clock next fire time in an independent transaction.
    pub async fn update_next_fire(
        &self,
        id: JobId,
        next_fire: Option<NaiveDateTime>,
    ) -> Result<(), StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE jobs SET next_fire_time = ?1, updated_at = ?2 WHERE id = ?3",
                    params![
                        next_fire.map(format_wall),
                        Utc::now().to_rfc3339(),
                        id.to_string()
                    ],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Transition to Scheduled with the computed next fire, in one
    /// independent transaction. Clears any stale error text.
    pub async fn mark_scheduled(
        &self,
        id: JobId,
        next_fire: NaiveDateTime,
    ) -> Result<(), StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE jobs SET status = ?1, next_fire_time = ?2, last_error = NULL,
                        updated_at = ?3
                     WHERE id = ?4",
                    params![
                        JobStatus::Scheduled.to_string(),
                        format_wall(next_fire),
                        Utc::now().to_rfc3339(),
                        id.to_string()
                    ],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Record a scheduling failure discovered after the create response was
    /// already sent. Commits regardless of any caller state.
    pub async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        let error = error.to_string();
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE jobs SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                    params![
                        JobStatus::CompletedFailure.to_string(),
                        error,
                        Utc::now().to_rfc3339(),
                        id.to_string()
                    ],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Persist the outcome of one fire: terminal (or re-scheduled) status,
    /// the next wall-clock fire, run counters and last error text. A pause
    /// that landed while the fire was running is preserved.
    pub async fn complete_fire(
        &self,
        id: JobId,
        status: JobStatus,
        next_fire: Option<NaiveDateTime>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.db
            .with(move |conn| {
                let failure_bump = i64::from(error.is_some());
                let rows = conn.execute(
                    "UPDATE jobs SET
                        status = CASE WHEN status = 'PAUSED' THEN status ELSE ?1 END,
                        next_fire_time = ?2, last_error = ?3,
                        run_count = run_count + 1, failure_count = failure_count + ?4,
                        updated_at = ?5
                     WHERE id = ?6",
                    params![
                        status.to_string(),
                        next_fire.map(format_wall),
                        error,
                        failure_bump,
                        Utc::now().to_rfc3339(),
                        id.to_string()
                    ],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Append a row to the fire log.
    pub async fn append_fire(&self, record: &FireRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO fire_log (fire_id, job_id, scheduled_for, started_at,
                        completed_at, outcome, error, records_published)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        record.fire_id.to_string(),
                        record.job_id.to_string(),
                        record.scheduled_for.to_rfc3339(),
                        record.started_at.to_rfc3339(),
                        record.completed_at.map(|t| t.to_rfc3339()),
                        record.outcome.to_string(),
                        record.error,
                        record.records_published as i64,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Fire history for a job, newest first.
    pub async fn fire_history(
        &self,
        id: JobId,
        limit: usize,
    ) -> Result<Vec<FireRecord>, StoreError> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT fire_id, job_id, scheduled_for, started_at, completed_at,
                            outcome, error, records_published
                     FROM fire_log WHERE job_id = ?1
                     ORDER BY started_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![id.to_string(), limit as i64], row_to_fire)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row??);
                }
                Ok(records)
            })
            .await
    }

    /// Aggregate counts for the health probe.
    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut counts = StatusCounts::default();
                for row in rows {
                    let (status, n) = row?;
                    let n = n as usize;
                    counts.total += n;
                    match status.parse::<JobStatus>() {
                        Ok(JobStatus::Scheduling) => counts.scheduling += n,
                        Ok(JobStatus::Scheduled) => counts.scheduled += n,
                        Ok(JobStatus::Running) => counts.running += n,
                        Ok(JobStatus::Paused) => counts.paused += n,
                        Ok(JobStatus::CompletedSuccess) => counts.completed_success += n,
                        Ok(JobStatus::CompletedFailure) => counts.completed_failure += n,
                        Err(_) => {}
                    }
                }
                Ok(counts)
            })
            .await
    }

    /// Insert a job in its own transaction.
    pub async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.db
            .in_transaction(move |tx, _| Self::insert_in(tx, &job))
            .await
    }
}

pub(crate) fn format_wall(wall: NaiveDateTime) -> String {
    wall.format(WALL_FORMAT).to_string()
}

pub(crate) fn parse_wall(s: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(s, WALL_FORMAT)
        .map_err(|e| StoreError::Serialization(format!("wall time {s}: {e}")))
}

pub(crate) fn parse_instant(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("instant {s}: {e}")))
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let id_str: String = row.get(0)?;
    let client_id: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let cron_expression: Option<String> = row.get(3)?;
    let time_zone: String = row.get(4)?;
    let start_str: Option<String> = row.get(5)?;
    let next_str: Option<String> = row.get(6)?;
    let status_str: String = row.get(7)?;
    let run_count: i64 = row.get(8)?;
    let failure_count: i64 = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;
    let created_str: String = row.get(11)?;
    let updated_str: String = row.get(12)?;

    Ok((|| -> Result<Job, StoreError> {
        let id: JobId = id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let schedule_kind = kind_str.parse().map_err(StoreError::Serialization)?;
        let status = status_str.parse().map_err(StoreError::Serialization)?;
        Ok(Job {
            id,
            client_id,
            schedule_kind,
            cron_expression,
            time_zone,
            start_time: start_str.as_deref().map(parse_wall).transpose()?,
            next_fire_time: next_str.as_deref().map(parse_wall).transpose()?,
            status,
            run_count: run_count as u64,
            failure_count: failure_count as u64,
            last_error,
            created_at: parse_instant(&created_str)?,
            updated_at: parse_instant(&updated_str)?,
        })
    })())
}

fn row_to_fire(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FireRecord, StoreError>> {
    let fire_id_str: String = row.get(0)?;
    let job_id_str: String = row.get(1)?;
    let scheduled_str: String = row.get(2)?;
    let started_str: String = row.get(3)?;
    let completed_str: Option<String> = row.get(4)?;
    let outcome_str: String = row.get(5)?;
    let error: Option<String> = row.get(6)?;
    let records_published: i64 = row.get(7)?;

    Ok((|| -> Result<FireRecord, StoreError> {
        Ok(FireRecord {
            fire_id: Uuid::parse_str(&fire_id_str)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            job_id: job_id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            scheduled_for: parse_instant(&scheduled_str)?,
            started_at: parse_instant(&started_str)?,
            completed_at: completed_str.as_deref().map(parse_instant).transpose()?,
            outcome: outcome_str
                .parse::<FireOutcome>()
                .map_err(StoreError::Serialization)?,
            error,
            records_published: records_published as u32,
        })
    })())
}
