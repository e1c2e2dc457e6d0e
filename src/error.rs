//! Error taxonomy shared across the service.
//!
//! Validation-class errors surface synchronously over HTTP; anything that
//! happens after the create response is absorbed into job status updates.

use crate::store::StoreError;
use crate::types::JobId;

/// Errors produced by the scheduling service and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Malformed request body or out-of-range field.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The supplied zone name does not resolve to IANA rules.
    #[error("unknown time zone: {0}")]
    ZoneInvalid(String),

    /// A one-shot start time is already in the past in its zone.
    #[error("start time {wall} is in the past in zone {zone}")]
    PastScheduleTime { wall: String, zone: String },

    /// Cron expression rejected (expected 6-field: sec min hour dom month dow).
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A post-commit scheduling hook failed; the job carries the terminal state.
    #[error("asynchronous scheduling failed for job {job_id}: {message}")]
    AsyncScheduling { job_id: JobId, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Stable machine-readable code used in API error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "ValidationError",
            SchedulerError::ZoneInvalid(_) => "ZoneInvalid",
            SchedulerError::PastScheduleTime { .. } => "PastScheduleTime",
            SchedulerError::InvalidCron(_) => "InvalidCron",
            SchedulerError::NotFound(_) => "NotFound",
            SchedulerError::AsyncScheduling { .. } => "AsyncSchedulingError",
            SchedulerError::Store(_) => "StoreError",
            SchedulerError::Publish(_) => "PublishError",
            SchedulerError::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            SchedulerError::ZoneInvalid("Mars/Olympus".into()).code(),
            "ZoneInvalid"
        );
        assert_eq!(
            SchedulerError::PastScheduleTime {
                wall: "2020-01-01T00:00:00".into(),
                zone: "UTC".into(),
            }
            .code(),
            "PastScheduleTime"
        );
        assert_eq!(SchedulerError::NotFound(JobId::new()).code(), "NotFound");
    }

    #[test]
    fn messages_name_the_offender() {
        let err = SchedulerError::InvalidCron("not a cron".into());
        assert!(err.to_string().contains("not a cron"));
    }
}
