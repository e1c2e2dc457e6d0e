//! Wire types for the HTTP API.
//!
//! Requests deliberately keep loose field types (strings, optionals) so the
//! service layer can reject bad input with structured 400 bodies instead of
//! serde deserialization failures.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::RecurrenceSpec;
use crate::error::SchedulerError;
use crate::service::CreateJob;
use crate::types::{FireRecord, Job};

/// Body of `POST /api/jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub client_id: Option<String>,
    /// IMMEDIATE, ONE_TIME or RECURRING.
    pub schedule_type: Option<String>,
    /// Local wall-clock, `yyyy-MM-ddTHH:mm:ss`, no zone suffix; interpreted
    /// in `time_zone`.
    pub start_time: Option<String>,
    /// IANA zone name; the configured default applies when omitted.
    pub time_zone: Option<String>,
    pub cron_expression: Option<String>,
    /// 1 = Monday .. 7 = Sunday.
    pub days_of_week: Option<Vec<u8>>,
    pub days_of_month: Option<Vec<u8>>,
    pub hourly_interval: Option<u32>,
    pub recurring_time_hour: Option<u8>,
    pub recurring_time_minute: Option<u8>,
}

const WALL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

impl TryFrom<JobRequest> for CreateJob {
    type Error = SchedulerError;

    fn try_from(request: JobRequest) -> Result<Self, Self::Error> {
        let client_id = request.client_id.unwrap_or_default();
        let schedule_kind = request
            .schedule_type
            .as_deref()
            .map(|s| {
                s.parse().map_err(|_| {
                    SchedulerError::Validation(format!(
                        "schedule_type must be IMMEDIATE, ONE_TIME or RECURRING, got {s}"
                    ))
                })
            })
            .transpose()?;
        let start_time = request
            .start_time
            .as_deref()
            .map(|s| {
                NaiveDateTime::parse_from_str(s, WALL_FORMAT).map_err(|_| {
                    SchedulerError::Validation(format!(
                        "start_time must be yyyy-MM-ddTHH:mm:ss with no zone suffix, got {s}"
                    ))
                })
            })
            .transpose()?;

        Ok(CreateJob {
            client_id,
            schedule_kind,
            start_time,
            time_zone: request.time_zone,
            recurrence: RecurrenceSpec {
                raw_expression: request.cron_expression,
                days_of_week: request.days_of_week,
                days_of_month: request.days_of_month,
                hourly_interval: request.hourly_interval,
                hour: request.recurring_time_hour,
                minute: request.recurring_time_minute,
            },
        })
    }
}

/// Projection of a job returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub client_id: String,
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    pub time_zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<String>,
    pub status: String,
    pub run_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.to_string(),
            client_id: job.client_id,
            schedule_type: job.schedule_kind.to_string(),
            cron_expression: job.cron_expression,
            time_zone: job.time_zone,
            start_time: job.start_time.map(format_wall),
            next_fire_time: job.next_fire_time.map(format_wall),
            status: job.status.to_string(),
            run_count: job.run_count,
            failure_count: job.failure_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            error: job.last_error,
        }
    }
}

fn format_wall(wall: NaiveDateTime) -> String {
    wall.format(WALL_FORMAT).to_string()
}

/// One fire log entry for `GET /api/jobs/{id}/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireResponse {
    pub fire_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub records_published: u32,
}

impl From<FireRecord> for FireResponse {
    fn from(record: FireRecord) -> Self {
        Self {
            fire_id: record.fire_id.to_string(),
            scheduled_for: record.scheduled_for,
            started_at: record.started_at,
            completed_at: record.completed_at,
            outcome: record.outcome.to_string(),
            error: record.error,
            records_published: record.records_published,
        }
    }
}

/// Error body shared by every failure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    /// Stable machine-readable code, e.g. `PastScheduleTime`.
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub jobs: crate::store::StatusCounts,
    pub engine: crate::engine::EngineHealth,
}
