//! HTTP route handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;

use super::types::{ErrorBody, FireResponse, HealthResponse, JobRequest, JobResponse};
use crate::engine::SchedulerEngine;
use crate::error::SchedulerError;
use crate::service::{CreateJob, JobService};
use crate::types::JobId;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
    pub engine: Arc<SchedulerEngine>,
    pub started_at: Instant,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn error_response(error: &SchedulerError) -> ApiError {
    let status = match error {
        SchedulerError::Validation(_)
        | SchedulerError::ZoneInvalid(_)
        | SchedulerError::PastScheduleTime { .. }
        | SchedulerError::InvalidCron(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            timestamp: Utc::now(),
            status: status.as_u16(),
            error: error.code().to_string(),
            message: error.to_string(),
            details: None,
        }),
    )
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse().map_err(|_| {
        error_response(&SchedulerError::Validation(format!(
            "malformed job id: {raw}"
        )))
    })
}

/// `POST /api/jobs`
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let create: CreateJob = request.try_into().map_err(|e| error_response(&e))?;
    match state.service.create(create).await {
        Ok(job) => Ok((StatusCode::CREATED, Json(job.into()))),
        Err(e) => Err(error_response(&e)),
    }
}

/// `GET /api/jobs`
pub async fn list_jobs(
    State(state): State<AppState>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    match state.service.list().await {
        Ok(jobs) => Ok(Json(jobs.into_iter().map(Into::into).collect())),
        Err(e) => Err(error_response(&e)),
    }
}

/// `GET /api/jobs/{id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let id = parse_job_id(&id)?;
    match state.service.get(id).await {
        Ok(job) => Ok(Json(job.into())),
        Err(e) => Err(error_response(&e)),
    }
}

/// `DELETE /api/jobs/{id}`. Accepted even when the job is already gone.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_job_id(&id)?;
    match state.service.delete(id).await {
        Ok(()) | Err(SchedulerError::NotFound(_)) => Ok(StatusCode::ACCEPTED),
        Err(e) => Err(error_response(&e)),
    }
}

/// `PATCH /api/jobs/{id}/pause`
pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let id = parse_job_id(&id)?;
    match state.service.pause(id).await {
        Ok(job) => Ok((StatusCode::ACCEPTED, Json(job.into()))),
        Err(e) => Err(error_response(&e)),
    }
}

/// `PATCH /api/jobs/{id}/resume`
pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let id = parse_job_id(&id)?;
    match state.service.resume(id).await {
        Ok(job) => Ok((StatusCode::ACCEPTED, Json(job.into()))),
        Err(e) => Err(error_response(&e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// `GET /api/jobs/{id}/history`
pub async fn job_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<FireResponse>>, ApiError> {
    let id = parse_job_id(&id)?;
    let limit = params.limit.unwrap_or(20).min(500);
    match state.service.history(id, limit).await {
        Ok(records) => Ok(Json(records.into_iter().map(Into::into).collect())),
        Err(e) => Err(error_response(&e)),
    }
}

/// `GET /health`
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, ApiError> {
    let jobs = state
        .service
        .status_counts()
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        jobs,
        engine: state.engine.health(),
    }))
}
