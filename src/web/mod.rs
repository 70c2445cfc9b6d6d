use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::monitor::coordinator::{CoordinatorHandle, EngineState};
use crate::server::config::{SchedulerConfig, TargetSeed};
use crate::store::MemoryTargetStore;
use crate::web::error::AppError;

pub mod error;

const SERVICE_NAME: &str = "scheduler-service";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinatorHandle>,
    pub store: Arc<MemoryTargetStore>,
    pub config: Arc<SchedulerConfig>,
}

async fn health_check_handler(State(app_state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let health = app_state.engine.health();
    let (status, label) = match health.state {
        EngineState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
        EngineState::Starting | EngineState::Running => (StatusCode::OK, "ok"),
    };
    (
        status,
        Json(json!({
            "status": label,
            "service": SERVICE_NAME,
            "engine": health,
        })),
    )
}

async fn reload_handler(State(app_state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let seeds = app_state.config.reload_targets()?;
    info!(targets = seeds.len(), "Reloading target definitions.");
    app_state
        .store
        .sync_definitions(seeds.iter().map(TargetSeed::to_target).collect());

    let report = app_state.engine.reload().await?;
    let rejected: Vec<String> = report.rejected.iter().map(|e| e.to_string()).collect();
    Ok(Json(json!({
        "message": "Jobs reloaded",
        "added": report.added,
        "updated": report.updated,
        "removed": report.removed,
        "unchanged": report.unchanged,
        "rejected": rejected,
    })))
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/api/reload", post(reload_handler))
        .with_state(app_state)
}
