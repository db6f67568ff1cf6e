use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use vidforge_core::ServiceError;

use crate::engine::{JobEngine, SubmitReceipt};
use crate::model::{CreateJobRequest, Job, JobListQuery, PollQuery, StatusCounts};

type EngineState = Arc<JobEngine>;

pub fn router(engine: Arc<JobEngine>) -> Router {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/@stats", get(job_stats))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/@poll", get(poll_job))
        .route("/jobs/{id}/@cancel", post(cancel_job))
        .with_state(engine)
}

// ---------------------------------------------------------------------------
// POST /jobs
// ---------------------------------------------------------------------------

async fn create_job(
    State(engine): State<EngineState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ServiceError> {
    let receipt = engine.submit(req)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

// ---------------------------------------------------------------------------
// GET /jobs
// ---------------------------------------------------------------------------

async fn list_jobs(
    State(engine): State<EngineState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let result = engine.list(&query)?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "total": result.total,
    })))
}

// ---------------------------------------------------------------------------
// GET /jobs/@stats
// ---------------------------------------------------------------------------

async fn job_stats(State(engine): State<EngineState>) -> Result<Json<StatusCounts>, ServiceError> {
    Ok(Json(engine.stats()?))
}

// ---------------------------------------------------------------------------
// GET /jobs/:id
// ---------------------------------------------------------------------------

async fn get_job(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ServiceError> {
    Ok(Json(engine.get(&id)?))
}

// ---------------------------------------------------------------------------
// GET /jobs/:id/@poll
// ---------------------------------------------------------------------------

async fn poll_job(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Job>, ServiceError> {
    let timeout = Duration::from_secs(query.timeout.min(120));
    Ok(Json(engine.poll(&id, timeout).await?))
}

// ---------------------------------------------------------------------------
// POST /jobs/:id/@cancel
// ---------------------------------------------------------------------------

async fn cancel_job(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ServiceError> {
    Ok(Json(engine.cancel(&id)?))
}
