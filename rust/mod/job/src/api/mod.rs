mod jobs;

use std::sync::Arc;

use axum::Router;

use crate::engine::JobEngine;

/// Build the job module router.
///
/// Routes:
/// - `POST /jobs`              — submit job
/// - `GET  /jobs`              — list jobs
/// - `GET  /jobs/@stats`       — per-status counts
/// - `GET  /jobs/{id}`         — get job
/// - `GET  /jobs/{id}/@poll`   — long-poll for changes
/// - `POST /jobs/{id}/@cancel` — request cancellation
pub fn router(engine: Arc<JobEngine>) -> Router {
    jobs::router(engine)
}
