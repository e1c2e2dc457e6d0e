//! End-to-end lifecycle tests: store, engine, workers, executor and service
//! wired together against an in-memory database and an in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use dispatchd::clock::SystemClock;
use dispatchd::cron::RecurrenceSpec;
use dispatchd::engine::workers::WorkerPool;
use dispatchd::engine::{EngineConfig, SchedulerEngine};
use dispatchd::executor::FireExecutor;
use dispatchd::publish::MemoryPublisher;
use dispatchd::service::{CreateJob, JobService};
use dispatchd::store::{Database, JobStore, MemoryTenantRecords, TriggerStore};
use dispatchd::types::{Job, JobId, JobStatus, ScheduleKind, TenantRecord};

struct Rig {
    service: JobService,
    jobs: JobStore,
    records: Arc<MemoryTenantRecords>,
    publisher: Arc<MemoryPublisher>,
    engine: Arc<SchedulerEngine>,
    pool: WorkerPool,
}

fn rig_on(db: Arc<Database>) -> Rig {
    let jobs = JobStore::new(db.clone());
    let triggers = TriggerStore::new(db.clone());
    let records = Arc::new(MemoryTenantRecords::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let clock = Arc::new(SystemClock);
    let (engine, fire_rx) =
        SchedulerEngine::new(EngineConfig::default(), clock.clone(), triggers);
    let executor = Arc::new(FireExecutor::new(
        jobs.clone(),
        records.clone(),
        publisher.clone(),
        clock.clone(),
    ));
    let pool = WorkerPool::start(4, fire_rx, executor, engine.clone());
    let service = JobService::new(db, jobs.clone(), engine.clone(), clock, "UTC".to_string());
    Rig {
        service,
        jobs,
        records,
        publisher,
        engine,
        pool,
    }
}

fn rig() -> Rig {
    rig_on(Database::open_in_memory().unwrap())
}

impl Rig {
    fn stop(&self) {
        self.pool.shutdown();
        self.engine.shutdown();
    }
}

fn seed_records(rig: &Rig, client: &str, ids: &[&str]) {
    for id in ids {
        rig.records.put(TenantRecord {
            id: id.to_string(),
            client_id: client.to_string(),
            payload: serde_json::json!({"e": format!("{id}@x")}),
        });
    }
}

async fn wait_for_status(jobs: &JobStore, id: JobId, want: JobStatus) -> Job {
    for _ in 0..80 {
        if let Some(job) = jobs.get(id).await.unwrap() {
            if job.status == want {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {id} never reached {want}");
}

#[tokio::test]
async fn immediate_job_publishes_all_tenant_records() {
    let rig = rig();
    seed_records(&rig, "CLIENT_ABC", &["a", "b"]);

    let job = rig
        .service
        .create(CreateJob {
            client_id: "CLIENT_ABC".to_string(),
            schedule_kind: Some(ScheduleKind::Immediate),
            time_zone: Some("UTC".to_string()),
            ..CreateJob::default()
        })
        .await
        .unwrap();

    let done = wait_for_status(&rig.jobs, job.id, JobStatus::CompletedSuccess).await;
    assert_eq!(done.run_count, 1);

    let mut keys: Vec<String> = rig.publisher.sent().into_iter().map(|(k, _)| k).collect();
    keys.sort();
    assert_eq!(keys, vec!["CLIENT_ABC-a", "CLIENT_ABC-b"]);
    rig.stop();
}

#[tokio::test]
async fn one_shot_fires_at_its_wall_clock_instant() {
    let rig = rig();
    seed_records(&rig, "CLIENT_ABC", &["a"]);

    let start = (chrono::Utc::now() + chrono::Duration::seconds(1)).naive_utc();
    let job = rig
        .service
        .create(CreateJob {
            client_id: "CLIENT_ABC".to_string(),
            schedule_kind: Some(ScheduleKind::OneShot),
            start_time: Some(start),
            time_zone: Some("UTC".to_string()),
            ..CreateJob::default()
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.next_fire_time, Some(start));

    // Not fired yet.
    assert!(rig.publisher.sent().is_empty());

    let done = wait_for_status(&rig.jobs, job.id, JobStatus::CompletedSuccess).await;
    assert_eq!(done.run_count, 1);
    assert_eq!(rig.publisher.sent().len(), 1);

    let history = rig.jobs.fire_history(job.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].records_published, 1);
    rig.stop();
}

#[tokio::test]
async fn failed_publish_marks_the_fire_failed_but_keeps_successes() {
    let rig = rig();
    seed_records(&rig, "CLIENT_ABC", &["a", "b"]);
    rig.publisher.fail_key("CLIENT_ABC-b");

    let job = rig
        .service
        .create(CreateJob {
            client_id: "CLIENT_ABC".to_string(),
            schedule_kind: Some(ScheduleKind::Immediate),
            ..CreateJob::default()
        })
        .await
        .unwrap();

    let done = wait_for_status(&rig.jobs, job.id, JobStatus::CompletedFailure).await;
    assert_eq!(done.failure_count, 1);
    assert!(done.last_error.is_some());

    // The successful publish stays on the bus.
    let sent = rig.publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "CLIENT_ABC-a");
    rig.stop();
}

#[tokio::test]
async fn paused_recurring_job_skips_fires_and_resumes() {
    let rig = rig();
    seed_records(&rig, "Y", &["r"]);

    let job = rig
        .service
        .create(CreateJob {
            client_id: "Y".to_string(),
            schedule_kind: Some(ScheduleKind::Recurring),
            time_zone: Some("UTC".to_string()),
            recurrence: RecurrenceSpec {
                raw_expression: Some("* * * * * *".to_string()),
                ..RecurrenceSpec::default()
            },
            ..CreateJob::default()
        })
        .await
        .unwrap();

    // A fire may be mid-flight at pause time (pause is a no-op from Running);
    // retry until the pause lands.
    let mut paused = rig.service.pause(job.id).await.unwrap();
    for _ in 0..20 {
        if paused.status == JobStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        paused = rig.service.pause(job.id).await.unwrap();
    }
    assert_eq!(paused.status, JobStatus::Paused);

    // Let anything already dispatched drain, then verify no further fires.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let runs_when_paused = rig.jobs.get(job.id).await.unwrap().unwrap().run_count;
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(
        rig.jobs.get(job.id).await.unwrap().unwrap().run_count,
        runs_when_paused,
        "paused job must not fire"
    );

    let resumed = rig.service.resume(job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Scheduled);
    assert!(resumed.next_fire_time.is_some());

    // Fires resume; skipped occurrences are not caught up (run count grows
    // by live fires only).
    for _ in 0..60 {
        let job = rig.jobs.get(job.id).await.unwrap().unwrap();
        if job.run_count > runs_when_paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        rig.jobs.get(job.id).await.unwrap().unwrap().run_count > runs_when_paused,
        "resumed job must fire again"
    );
    rig.stop();
}

#[tokio::test]
async fn recurring_fire_advances_next_fire_time() {
    let rig = rig();
    seed_records(&rig, "Y", &["r"]);

    let job = rig
        .service
        .create(CreateJob {
            client_id: "Y".to_string(),
            schedule_kind: Some(ScheduleKind::Recurring),
            time_zone: Some("UTC".to_string()),
            recurrence: RecurrenceSpec {
                raw_expression: Some("* * * * * *".to_string()),
                ..RecurrenceSpec::default()
            },
            ..CreateJob::default()
        })
        .await
        .unwrap();
    let first_next = job.next_fire_time.expect("next fire set at creation");

    // After a fire the job returns to Scheduled with a later next fire.
    for _ in 0..60 {
        let job = rig.jobs.get(job.id).await.unwrap().unwrap();
        if job.run_count >= 1 && job.status == JobStatus::Scheduled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let after = rig.jobs.get(job.id).await.unwrap().unwrap();
    assert!(after.run_count >= 1);
    assert!(after.next_fire_time.expect("still recurring") > first_next);
    rig.stop();
}

#[tokio::test]
async fn delete_cancels_pending_fires() {
    let rig = rig();
    seed_records(&rig, "CLIENT_ABC", &["a"]);

    let start = (chrono::Utc::now() + chrono::Duration::seconds(2)).naive_utc();
    let job = rig
        .service
        .create(CreateJob {
            client_id: "CLIENT_ABC".to_string(),
            schedule_kind: Some(ScheduleKind::OneShot),
            start_time: Some(start),
            time_zone: Some("UTC".to_string()),
            ..CreateJob::default()
        })
        .await
        .unwrap();

    rig.service.delete(job.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(rig.publisher.sent().is_empty(), "deleted job must not fire");
    assert!(rig.jobs.get(job.id).await.unwrap().is_none());
    rig.stop();
}

#[tokio::test]
async fn triggers_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    // First process: create a one-shot due shortly, then go down before it fires.
    let db = Database::open(&path).unwrap();
    let first = rig_on(db);
    seed_records(&first, "CLIENT_ABC", &["a"]);
    let start = (chrono::Utc::now() + chrono::Duration::seconds(2)).naive_utc();
    let job = first
        .service
        .create(CreateJob {
            client_id: "CLIENT_ABC".to_string(),
            schedule_kind: Some(ScheduleKind::OneShot),
            start_time: Some(start),
            time_zone: Some("UTC".to_string()),
            ..CreateJob::default()
        })
        .await
        .unwrap();
    first.stop();

    // Second process over the same database: recovery must fire the job.
    let db = Database::open(&path).unwrap();
    let second = rig_on(db);
    seed_records(&second, "CLIENT_ABC", &["a"]);
    let recovered = second.engine.rehydrate().await.unwrap();
    assert_eq!(recovered, 1);

    let done = wait_for_status(&second.jobs, job.id, JobStatus::CompletedSuccess).await;
    assert_eq!(done.run_count, 1);
    assert_eq!(second.publisher.sent().len(), 1);
    second.stop();
}
