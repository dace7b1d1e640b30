use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use pricewise_store::file_store::FileStore;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    files: Arc<dyn FileStore>,
}

impl HealthState {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub storage: HealthCheck,
    pub checked_at: String,
}

pub fn router(files: Arc<dyn FileStore>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState::new(files))
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let storage = storage_check(state.files.as_ref()).await;
    let ready = storage.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "pricewise-server runtime initialized".to_string(),
        },
        storage,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn storage_check(files: &dyn FileStore) -> HealthCheck {
    match files.health_check().await {
        Ok(()) => HealthCheck { status: "ready", detail: "storage root is available".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("storage check failed: {error}") }
        }
    }
}
