use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use store_backup::restore::ClearReport;
use store_backup::utils::blocking;
use store_backup::{DiagnosticReport, RestoreIntent, StartupOutcome};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stage", post(stage_restore))
        .route("/diagnostics", get(diagnostics))
        .route("/emergency-clear", post(emergency_clear))
        .route("/startup", get(startup_outcome))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    pub backup_id: String,
}

async fn stage_restore(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StageRequest>,
) -> Result<(StatusCode, Json<RestoreIntent>), AppError> {
    if req.backup_id.trim().is_empty() {
        return Err(AppError::BadRequest("backupId is required".into()));
    }
    let intent = state.system.coordinator.stage_restore(&req.backup_id).await?;
    Ok((StatusCode::CREATED, Json(intent)))
}

async fn diagnostics(State(state): State<Arc<AppState>>) -> Result<Json<DiagnosticReport>, AppError> {
    let reporter = state.system.diagnostics();
    let report = blocking(move || Ok(reporter.report())).await?;
    Ok(Json(report))
}

async fn emergency_clear(State(state): State<Arc<AppState>>) -> Result<Json<ClearReport>, AppError> {
    let cleanup = state.system.emergency();
    let report = blocking(move || cleanup.force_clear()).await?;
    Ok(Json(report))
}

async fn startup_outcome(State(state): State<Arc<AppState>>) -> Json<StartupOutcome> {
    Json(state.startup.clone())
}
