//! Shared types for the scheduling subsystem.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Fire once, as soon as the creating transaction commits.
    #[serde(rename = "IMMEDIATE")]
    Immediate,
    /// Fire once at a wall-clock instant in the job's zone.
    #[serde(rename = "ONE_TIME")]
    OneShot,
    /// Fire on a cron recurrence in the job's zone.
    #[serde(rename = "RECURRING")]
    Recurring,
}

impl ScheduleKind {
    /// One-shot and immediate jobs terminate after a single fire.
    pub fn is_single_fire(&self) -> bool {
        !matches!(self, ScheduleKind::Recurring)
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleKind::Immediate => write!(f, "IMMEDIATE"),
            ScheduleKind::OneShot => write!(f, "ONE_TIME"),
            ScheduleKind::Recurring => write!(f, "RECURRING"),
        }
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMMEDIATE" => Ok(ScheduleKind::Immediate),
            "ONE_TIME" => Ok(ScheduleKind::OneShot),
            "RECURRING" => Ok(ScheduleKind::Recurring),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Persisted but not yet handed to the scheduling engine.
    #[default]
    Scheduling,
    /// Registered with the engine and waiting for its next fire.
    Scheduled,
    /// A worker is executing a fire right now.
    Running,
    /// Terminal: the last fire published every record.
    CompletedSuccess,
    /// Terminal for single-fire jobs; recurring jobs re-enter Running on the next fire.
    CompletedFailure,
    /// Suspended; the trigger is retained but never dispatched.
    Paused,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::CompletedSuccess | JobStatus::CompletedFailure)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Scheduling => write!(f, "SCHEDULING"),
            JobStatus::Scheduled => write!(f, "SCHEDULED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::CompletedSuccess => write!(f, "COMPLETED_SUCCESS"),
            JobStatus::CompletedFailure => write!(f, "COMPLETED_FAILURE"),
            JobStatus::Paused => write!(f, "PAUSED"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULING" => Ok(JobStatus::Scheduling),
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED_SUCCESS" => Ok(JobStatus::CompletedSuccess),
            "COMPLETED_FAILURE" => Ok(JobStatus::CompletedFailure),
            "PAUSED" => Ok(JobStatus::Paused),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted scheduling intent owned by a tenant.
///
/// `start_time` and `next_fire_time` are wall-clock values in `time_zone`;
/// the absolute instant lives on the trigger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: String,
    pub schedule_kind: ScheduleKind,
    pub cron_expression: Option<String>,
    pub time_zone: String,
    pub start_time: Option<NaiveDateTime>,
    pub next_fire_time: Option<NaiveDateTime>,
    pub status: JobStatus,
    pub run_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(client_id: String, schedule_kind: ScheduleKind, time_zone: String) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            client_id,
            schedule_kind,
            cron_expression: None,
            time_zone,
            start_time: None,
            next_fire_time: None,
            status: JobStatus::Scheduling,
            run_count: 0,
            failure_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable firing schedule for a job. One row per active job; the absolute
/// instant here and the wall-clock `next_fire_time` on the job denote the
/// same point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub job_id: JobId,
    pub next_fire_at: DateTime<Utc>,
    pub cron_expression: Option<String>,
    pub time_zone: String,
    pub paused: bool,
}

/// What to register with the scheduling engine.
#[derive(Debug, Clone)]
pub enum TriggerSpec {
    /// Fire as soon as possible.
    FireNow,
    /// Fire once at an absolute instant.
    FireAt(DateTime<Utc>),
    /// Fire on a cron recurrence evaluated in `zone`.
    FireCron { expression: String, zone: String },
}

/// Outcome of a single fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FireOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for FireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FireOutcome::Succeeded => write!(f, "succeeded"),
            FireOutcome::Failed => write!(f, "failed"),
            FireOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for FireOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(FireOutcome::Succeeded),
            "failed" => Ok(FireOutcome::Failed),
            "cancelled" => Ok(FireOutcome::Cancelled),
            other => Err(format!("unknown fire outcome: {other}")),
        }
    }
}

/// Record of a single fire, appended to the fire log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireRecord {
    pub fire_id: Uuid,
    pub job_id: JobId,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: FireOutcome,
    pub error: Option<String>,
    pub records_published: u32,
}

/// An opaque per-tenant record fetched from the entity store and published
/// to the bus on each fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    pub client_id: String,
    pub payload: serde_json::Value,
}

impl TenantRecord {
    /// Message key routing all of a tenant's records to the same partition.
    pub fn message_key(&self) -> String {
        format!("{}-{}", self.client_id, self.id)
    }
}
