use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use store_backup::utils::blocking;

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let store = state.system.store.clone();
    let backup = blocking(move || store.health()).await?;
    let uptime = chrono::Utc::now().signed_duration_since(state.started_at);

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime.num_seconds(),
        "backup": backup,
        "running": state.system.lock.running(),
        "startup": state.startup,
    })))
}
