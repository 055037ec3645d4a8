pub mod backups;
pub mod health;
pub mod restore;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api/backups", backups::router())
        .nest("/api/restore", restore::router())
        .route("/api/health", axum::routing::get(health::health))
        .route("/ws", axum::routing::get(crate::ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use store_backup::config::{Config, DataEngine};
    use store_backup::BackupSystem;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> (Router, Config) {
        let mut config = Config::for_data_dir(dir.path());
        config.data.engine = DataEngine::File;
        config.ensure_dirs().unwrap();
        std::fs::write(&config.data.live_path, b"store data").unwrap();
        let (system, startup) = BackupSystem::boot(config.clone()).unwrap();
        (create_router(Arc::new(AppState::new(system, startup))), config)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_starts_degraded() {
        let dir = tempdir().unwrap();
        let (app, _) = app(&dir);

        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backup"]["status"], "degraded");
        assert_eq!(body["startup"]["outcome"], "noIntent");
    }

    #[tokio::test]
    async fn test_create_list_and_stage() {
        let dir = tempdir().unwrap();
        let (app, config) = app(&dir);

        let (status, created) = call(&app, Method::POST, "/api/backups", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["trigger"], "manual");

        let (status, list) = call(&app, Method::GET, "/api/backups?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, one) = call(&app, Method::GET, &format!("/api/backups/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one["checksum"], created["checksum"]);

        let body = serde_json::json!({ "backupId": id });
        let (status, intent) = call(&app, Method::POST, "/api/restore/stage", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(intent["status"], "pending");
        assert!(config.restore.intent_path.exists());

        let (status, _) = call(&app, Method::POST, "/api/restore/stage", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, report) = call(&app, Method::GET, "/api/restore/diagnostics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["intent"]["state"], "present");

        let (status, cleared) = call(&app, Method::POST, "/api/restore/emergency-clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["descriptorRemoved"], true);
        assert!(!config.restore.intent_path.exists());
    }

    #[tokio::test]
    async fn test_unknown_backup_is_404() {
        let dir = tempdir().unwrap();
        let (app, _) = app(&dir);

        let (status, body) = call(&app, Method::GET, "/api/backups/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let stage = serde_json::json!({ "backupId": "nope" });
        let (status, _) = call(&app, Method::POST, "/api/restore/stage", Some(stage)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
