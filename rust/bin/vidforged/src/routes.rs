//! Route registration — module routes plus system endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use job::engine::JobEngine;

/// Application shared state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobEngine>,
}

/// Build the complete router with all routes.
pub fn build_router(state: AppState, module_routes: Vec<(String, Router)>) -> Router {
    let mut app: Router = Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .with_state(state);

    // Mount each module's routes under /{module_name}. Module routes
    // carry their own state already.
    for (name, router) in module_routes {
        app = app.nest(&format!("/{name}"), router);
    }

    app
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.health() {
        Ok(snapshot) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "status": "ok",
                "queue": snapshot.queue,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({
                "status": "unavailable",
                "error": e.to_string(),
            })),
        ),
    }
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": "vidforged",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
