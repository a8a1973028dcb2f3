use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/cache`
pub async fn cache_stats(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let stats = state.services().cache.stats();
    let snapshot_path = state
        .snapshot_store
        .as_ref()
        .map(|store| store.path().display().to_string());

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "cache": stats,
        "snapshot_path": snapshot_path
    })))
}
