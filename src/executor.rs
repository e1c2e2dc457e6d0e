//! Per-fire execution.
//!
//! A fire reads the owning tenant's records and publishes each one; the
//! fire succeeds only if every publish succeeds. Status write-back happens
//! in independent transactions so outcomes survive no matter what state the
//! dispatching side is in. The executor is not retried: a failed fire is a
//! failed fire, and a recurring job simply waits for its next instant.

use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::engine::Fire;
use crate::publish::RecordPublisher;
use crate::store::{JobStore, TenantRecordSource};
use crate::types::{FireOutcome, FireRecord, Job, JobStatus};

pub struct FireExecutor {
    jobs: JobStore,
    records: Arc<dyn TenantRecordSource>,
    publisher: Arc<dyn RecordPublisher>,
    clock: Arc<dyn Clock>,
}

impl FireExecutor {
    pub fn new(
        jobs: JobStore,
        records: Arc<dyn TenantRecordSource>,
        publisher: Arc<dyn RecordPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            records,
            publisher,
            clock,
        }
    }

    /// Execute one fire to completion. Never returns an error; everything
    /// observable lands in the job row and the fire log.
    pub async fn run_fire(&self, fire: &Fire) {
        let started_at = self.clock.now();
        let job = match self.jobs.get(fire.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %fire.job_id, "job row gone, aborting fire");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %fire.job_id, "failed to load job for fire: {e}");
                return;
            }
        };

        // A pause that landed after dispatch drops the occurrence.
        if job.status == JobStatus::Paused {
            tracing::debug!(job_id = %job.id, "job paused after dispatch, dropping fire");
            return;
        }

        if let Err(e) = self.jobs.update_status(job.id, JobStatus::Running).await {
            tracing::warn!(job_id = %job.id, "could not mark job running, aborting fire: {e}");
            return;
        }

        let result = tokio::select! {
            _ = fire.cancel.cancelled() => None,
            outcome = self.publish_all(&job) => Some(outcome),
        };
        let completed_at = self.clock.now();

        let Some((published, error)) = result else {
            // The job is being deleted; stop without publishing the rest and
            // leave the row to the deleter.
            tracing::info!(job_id = %job.id, "fire cancelled mid-run");
            let record = FireRecord {
                fire_id: Uuid::new_v4(),
                job_id: job.id,
                scheduled_for: fire.due_at,
                started_at,
                completed_at: Some(completed_at),
                outcome: FireOutcome::Cancelled,
                error: None,
                records_published: 0,
            };
            // Row may already be gone; the cascade makes this a no-op then.
            if let Err(e) = self.jobs.append_fire(&record).await {
                tracing::debug!(job_id = %job.id, "skipping fire log for cancelled fire: {e}");
            }
            return;
        };

        let status = match (&job.schedule_kind, error.is_none()) {
            (crate::types::ScheduleKind::Recurring, true) => JobStatus::Scheduled,
            (_, true) => JobStatus::CompletedSuccess,
            (_, false) => JobStatus::CompletedFailure,
        };
        // The engine already advanced the trigger; mirror the instant as
        // wall-clock in the job's zone for display.
        let next_wall = fire.next_fire_at.and_then(|at| {
            clock::resolve_zone(&job.time_zone)
                .ok()
                .map(|tz| clock::to_wall(at, tz))
        });

        if let Err(e) = self
            .jobs
            .complete_fire(job.id, status, next_wall, error.clone())
            .await
        {
            tracing::error!(job_id = %job.id, "failed to persist fire outcome: {e}");
        }

        let record = FireRecord {
            fire_id: Uuid::new_v4(),
            job_id: job.id,
            scheduled_for: fire.due_at,
            started_at,
            completed_at: Some(completed_at),
            outcome: if error.is_none() {
                FireOutcome::Succeeded
            } else {
                FireOutcome::Failed
            },
            error: error.clone(),
            records_published: published,
        };
        if let Err(e) = self.jobs.append_fire(&record).await {
            tracing::error!(job_id = %job.id, "failed to append fire log: {e}");
        }

        match &error {
            None => tracing::info!(
                job_id = %job.id,
                client_id = %job.client_id,
                published,
                "fire completed"
            ),
            Some(error) => tracing::warn!(
                job_id = %job.id,
                client_id = %job.client_id,
                published,
                "fire failed: {error}"
            ),
        }
    }

    /// Publish every tenant record concurrently. Returns the success count
    /// and, when any publish failed, an aggregate error. An empty record set
    /// is a success with zero publishes.
    async fn publish_all(&self, job: &Job) -> (u32, Option<String>) {
        let records = match self.records.records_for(&job.client_id).await {
            Ok(records) => records,
            Err(e) => return (0, Some(format!("tenant record read failed: {e}"))),
        };
        if records.is_empty() {
            return (0, None);
        }

        let total = records.len();
        let results = join_all(records.iter().map(|r| self.publisher.publish(r))).await;
        let published = results.iter().filter(|r| r.is_ok()).count();
        let first_error = results.iter().find_map(|r| r.as_ref().err());
        match first_error {
            None => (published as u32, None),
            Some(e) => (
                published as u32,
                Some(format!(
                    "{}/{} publishes failed, first: {e}",
                    total - published,
                    total
                )),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::publish::{MemoryPublisher, PublishAck, PublishError};
    use crate::store::{Database, MemoryTenantRecords};
    use crate::types::{ScheduleKind, TenantRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        jobs: JobStore,
        records: Arc<MemoryTenantRecords>,
        publisher: Arc<MemoryPublisher>,
        executor: FireExecutor,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let jobs = JobStore::new(db);
        let records = Arc::new(MemoryTenantRecords::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let executor = FireExecutor::new(
            jobs.clone(),
            records.clone(),
            publisher.clone(),
            Arc::new(SystemClock),
        );
        Fixture {
            jobs,
            records,
            publisher,
            executor,
        }
    }

    async fn seed_job(fx: &Fixture, kind: ScheduleKind) -> Job {
        let job = Job::new("CLIENT_ABC".to_string(), kind, "UTC".to_string());
        fx.jobs.insert(&job).await.unwrap();
        job
    }

    fn record(id: &str) -> TenantRecord {
        TenantRecord {
            id: id.to_string(),
            client_id: "CLIENT_ABC".to_string(),
            payload: json!({"e": format!("{id}@x")}),
        }
    }

    fn fire(job: &Job) -> Fire {
        Fire {
            job_id: job.id,
            due_at: Utc::now(),
            next_fire_at: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn publishes_every_record_and_completes() {
        let fx = fixture();
        let job = seed_job(&fx, ScheduleKind::Immediate).await;
        fx.records.put(record("a"));
        fx.records.put(record("b"));

        fx.executor.run_fire(&fire(&job)).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedSuccess);
        assert_eq!(loaded.run_count, 1);
        assert_eq!(loaded.failure_count, 0);

        let mut keys: Vec<String> = fx.publisher.sent().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["CLIENT_ABC-a", "CLIENT_ABC-b"]);

        let history = fx.jobs.fire_history(job.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, FireOutcome::Succeeded);
        assert_eq!(history[0].records_published, 2);
    }

    #[tokio::test]
    async fn empty_record_set_is_success() {
        let fx = fixture();
        let job = seed_job(&fx, ScheduleKind::OneShot).await;

        fx.executor.run_fire(&fire(&job)).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedSuccess);
        assert!(fx.publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn any_publish_failure_fails_the_fire_but_keeps_successes() {
        let fx = fixture();
        let job = seed_job(&fx, ScheduleKind::Immediate).await;
        fx.records.put(record("a"));
        fx.records.put(record("b"));
        fx.publisher.fail_key("CLIENT_ABC-b");

        fx.executor.run_fire(&fire(&job)).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedFailure);
        assert_eq!(loaded.failure_count, 1);
        assert!(loaded.last_error.as_deref().unwrap().contains("1/2"));

        // The successful publish is not rolled back.
        let sent = fx.publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "CLIENT_ABC-a");
    }

    #[tokio::test]
    async fn record_read_error_fails_the_fire() {
        let fx = fixture();
        let job = seed_job(&fx, ScheduleKind::Immediate).await;
        fx.records.fail_reads(true);

        fx.executor.run_fire(&fire(&job)).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedFailure);
        assert!(loaded
            .last_error
            .as_deref()
            .unwrap()
            .contains("record read failed"));
    }

    #[tokio::test]
    async fn recurring_success_returns_to_scheduled_with_next_fire() {
        let fx = fixture();
        let job = seed_job(&fx, ScheduleKind::Recurring).await;
        fx.records.put(record("a"));

        let next = Utc::now() + chrono::Duration::hours(1);
        let mut f = fire(&job);
        f.next_fire_at = Some(next);
        fx.executor.run_fire(&f).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Scheduled);
        assert_eq!(
            loaded.next_fire_time,
            Some(crate::clock::to_wall(next, "UTC".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn recurring_failure_still_advances_next_fire() {
        let fx = fixture();
        let job = seed_job(&fx, ScheduleKind::Recurring).await;
        fx.records.put(record("a"));
        fx.publisher.fail_all(true);

        let next = Utc::now() + chrono::Duration::hours(1);
        let mut f = fire(&job);
        f.next_fire_at = Some(next);
        fx.executor.run_fire(&f).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedFailure);
        assert!(loaded.next_fire_time.is_some());
    }

    #[tokio::test]
    async fn fire_dispatched_before_a_pause_is_dropped() {
        let fx = fixture();
        let mut job = Job::new(
            "CLIENT_ABC".to_string(),
            ScheduleKind::Recurring,
            "UTC".to_string(),
        );
        job.status = JobStatus::Paused;
        fx.jobs.insert(&job).await.unwrap();
        fx.records.put(record("a"));

        fx.executor.run_fire(&fire(&job)).await;

        let loaded = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Paused);
        assert_eq!(loaded.run_count, 0);
        assert!(fx.publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_job_aborts_without_side_effects() {
        let fx = fixture();
        let job = Job::new(
            "CLIENT_ABC".to_string(),
            ScheduleKind::Immediate,
            "UTC".to_string(),
        );
        // Never inserted.
        fx.executor.run_fire(&fire(&job)).await;
        assert!(fx.publisher.sent().is_empty());
    }

    struct SlowPublisher(Arc<MemoryPublisher>);

    #[async_trait]
    impl RecordPublisher for SlowPublisher {
        async fn publish(&self, record: &TenantRecord) -> Result<PublishAck, PublishError> {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            self.0.publish(record).await
        }
    }

    #[tokio::test]
    async fn cancellation_stops_publishing() {
        let db = Database::open_in_memory().unwrap();
        let jobs = JobStore::new(db);
        let records = Arc::new(MemoryTenantRecords::new());
        let inner = Arc::new(MemoryPublisher::new());
        let executor = FireExecutor::new(
            jobs.clone(),
            records.clone(),
            Arc::new(SlowPublisher(inner.clone())),
            Arc::new(SystemClock),
        );

        let job = Job::new(
            "CLIENT_ABC".to_string(),
            ScheduleKind::Immediate,
            "UTC".to_string(),
        );
        jobs.insert(&job).await.unwrap();
        records.put(record("a"));

        let f = fire(&job);
        let token = f.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });
        executor.run_fire(&f).await;

        // Nothing was delivered and no terminal status was written.
        assert!(inner.sent().is_empty());
        let history = jobs.fire_history(job.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, FireOutcome::Cancelled);
    }
}
