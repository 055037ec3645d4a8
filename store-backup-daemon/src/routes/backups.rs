use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use store_backup::utils::blocking;
use store_backup::BackupRecord;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/{id}", get(get_backup))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupRecord>>, AppError> {
    let store = state.system.store.clone();
    let records = blocking(move || store.list(query.limit)).await?;
    Ok(Json(records))
}

/// Manual backup. Retention is applied afterwards, as for scheduled runs.
async fn create_backup(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<BackupRecord>), AppError> {
    let record = state.system.schedule.run_now().await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, AppError> {
    let store = state.system.store.clone();
    let record = blocking(move || store.get(&id)).await?;
    Ok(Json(record))
}
