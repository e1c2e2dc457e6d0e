//! API-facing job service.
//!
//! Owns validation order and the lifecycle hand-off: a job is persisted as
//! `Scheduling` inside a transaction, and only a post-commit hook registers
//! it with the engine. The engine therefore never sees a row that could
//! still roll back. Hook failures are recorded as `COMPLETED_FAILURE` in an
//! independent transaction; by then the caller already holds a response.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};

use crate::clock::{self, Clock};
use crate::cron::{self, RecurrenceSpec};
use crate::engine::SchedulerEngine;
use crate::error::SchedulerError;
use crate::store::{Database, JobStore, StatusCounts};
use crate::types::{FireRecord, Job, JobId, JobStatus, ScheduleKind, TriggerSpec};

/// Seconds of slack when rejecting past one-shot start times.
const PAST_GRACE_SECS: i64 = 30;

/// Validated create input. The HTTP layer converts its wire shape into this.
#[derive(Debug, Clone, Default)]
pub struct CreateJob {
    pub client_id: String,
    pub schedule_kind: Option<ScheduleKind>,
    pub start_time: Option<NaiveDateTime>,
    pub time_zone: Option<String>,
    pub recurrence: RecurrenceSpec,
}

pub struct JobService {
    db: Arc<Database>,
    jobs: JobStore,
    engine: Arc<SchedulerEngine>,
    clock: Arc<dyn Clock>,
    default_zone: String,
}

impl JobService {
    pub fn new(
        db: Arc<Database>,
        jobs: JobStore,
        engine: Arc<SchedulerEngine>,
        clock: Arc<dyn Clock>,
        default_zone: String,
    ) -> Self {
        Self {
            db,
            jobs,
            engine,
            clock,
            default_zone,
        }
    }

    /// Create a job. Returns the projection read back after the creating
    /// transaction committed and the scheduling hook ran.
    pub async fn create(&self, request: CreateJob) -> Result<Job, SchedulerError> {
        if request.client_id.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "client_id must not be blank".to_string(),
            ));
        }
        let kind = request.schedule_kind.ok_or_else(|| {
            SchedulerError::Validation("schedule_type is required".to_string())
        })?;
        let zone_name = request
            .time_zone
            .clone()
            .filter(|z| !z.trim().is_empty())
            .unwrap_or_else(|| self.default_zone.clone());
        let tz = clock::resolve_zone(&zone_name)?;

        let mut job = Job::new(request.client_id, kind, zone_name);
        match kind {
            ScheduleKind::Immediate => {}
            ScheduleKind::OneShot => {
                let wall = request.start_time.ok_or_else(|| {
                    SchedulerError::Validation(
                        "start_time is required for ONE_TIME jobs".to_string(),
                    )
                })?;
                let instant = clock::to_instant(wall, tz);
                if instant < self.clock.now() - Duration::seconds(PAST_GRACE_SECS) {
                    return Err(SchedulerError::PastScheduleTime {
                        wall: wall.format("%Y-%m-%dT%H:%M:%S").to_string(),
                        zone: job.time_zone,
                    });
                }
                job.start_time = Some(wall);
            }
            ScheduleKind::Recurring => {
                job.cron_expression = Some(cron::canonical_expression(&request.recurrence)?);
                // Creation marker only; recurrence is driven by the cron.
                job.start_time = request.start_time;
            }
        }

        let job_id = job.id;
        let jobs = self.jobs.clone();
        let engine = self.engine.clone();
        let stored = job;
        self.db
            .in_transaction(move |tx, hooks| {
                JobStore::insert_in(tx, &stored)?;
                hooks.after_commit(async move {
                    finalize_registration(jobs, engine, job_id).await;
                });
                Ok(())
            })
            .await?;

        self.jobs
            .get(job_id)
            .await?
            .ok_or(SchedulerError::NotFound(job_id))
    }

    pub async fn get(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.jobs
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.jobs.list().await?)
    }

    /// Remove the job, its trigger, any queued fire, and cancel an in-flight
    /// run. Engine trouble is logged but never blocks row deletion.
    pub async fn delete(&self, id: JobId) -> Result<(), SchedulerError> {
        self.jobs.get(id).await?.ok_or(SchedulerError::NotFound(id))?;
        if let Err(e) = self.engine.deregister(id).await {
            tracing::warn!(job_id = %id, "engine deregistration failed during delete: {e}");
        }
        self.jobs.delete(id).await?;
        tracing::info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Pause a scheduled job. A no-op for any other state.
    pub async fn pause(&self, id: JobId) -> Result<Job, SchedulerError> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Scheduled => {
                self.engine.pause(id).await?;
                self.jobs.update_status(id, JobStatus::Paused).await?;
                self.get(id).await
            }
            _ => Ok(job),
        }
    }

    /// Resume a paused job. Skipped fires are dropped; the schedule restarts
    /// from now. A no-op for any other state.
    pub async fn resume(&self, id: JobId) -> Result<Job, SchedulerError> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Paused => {
                let next = self.engine.resume(id).await?;
                let tz = clock::resolve_zone(&job.time_zone)?;
                self.jobs
                    .mark_scheduled(id, clock::to_wall(next, tz))
                    .await?;
                self.get(id).await
            }
            _ => Ok(job),
        }
    }

    pub async fn history(&self, id: JobId, limit: usize) -> Result<Vec<FireRecord>, SchedulerError> {
        self.get(id).await?;
        Ok(self.jobs.fire_history(id, limit).await?)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, SchedulerError> {
        Ok(self.jobs.status_counts().await?)
    }
}

/// Post-commit hook body. Must absorb every failure into job state.
async fn finalize_registration(jobs: JobStore, engine: Arc<SchedulerEngine>, job_id: JobId) {
    if let Err(e) = try_finalize(&jobs, &engine, job_id).await {
        let error = SchedulerError::AsyncScheduling {
            job_id,
            message: e.to_string(),
        };
        tracing::error!(job_id = %job_id, "{error}");
        if let Err(persist) = jobs.mark_failed(job_id, &error.to_string()).await {
            tracing::error!(job_id = %job_id, "could not record scheduling failure: {persist}");
        }
    }
}

async fn try_finalize(
    jobs: &JobStore,
    engine: &SchedulerEngine,
    job_id: JobId,
) -> Result<(), SchedulerError> {
    // Re-read: the committed row is the authoritative state.
    let job = jobs
        .get(job_id)
        .await?
        .ok_or(SchedulerError::NotFound(job_id))?;
    let tz = clock::resolve_zone(&job.time_zone)?;
    let spec = match job.schedule_kind {
        ScheduleKind::Immediate => TriggerSpec::FireNow,
        ScheduleKind::OneShot => {
            let wall = job.start_time.ok_or_else(|| {
                SchedulerError::Internal("one-shot job without start_time".to_string())
            })?;
            TriggerSpec::FireAt(clock::to_instant(wall, tz))
        }
        ScheduleKind::Recurring => {
            let expression = job.cron_expression.clone().ok_or_else(|| {
                SchedulerError::Internal("recurring job without cron".to_string())
            })?;
            TriggerSpec::FireCron {
                expression,
                zone: job.time_zone.clone(),
            }
        }
    };
    let instant = engine.register(job_id, spec).await?;
    jobs.mark_scheduled(job_id, clock::to_wall(instant, tz))
        .await?;
    Ok(())
}
