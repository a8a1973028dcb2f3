//! # Model Registry API
//!
//! - `GET /api/v1/models`: every registry entry with its status, plus totals
//! - `POST /api/v1/models/load`: warm a language pair before the camera needs it

use crate::language::{LanguagePair, LanguageTag};
use crate::models::{ModelKey, RegistryError};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub source_language: String,
    pub target_language: String,
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub key: String,
    pub status: String,
    pub loaded: bool,
    pub description: String,
    pub total_acquisitions: u64,
    pub details: serde_json::Value,
}

pub async fn list_models(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let registry = &state.services().registry;

    let mut models: Vec<ModelInfoResponse> = registry
        .entries()
        .into_iter()
        .map(|entry| ModelInfoResponse {
            key: entry.key.to_string(),
            status: status_name(&entry.status).to_string(),
            loaded: entry.status.is_loaded(),
            description: entry.status.description(),
            total_acquisitions: entry.total_acquisitions,
            details: serde_json::to_value(&entry.status).unwrap_or_default(),
        })
        .collect();
    models.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "models": models,
        "summary": registry.summary()
    })))
}

fn status_name(status: &crate::models::ModelStatus) -> &'static str {
    use crate::models::ModelStatus;
    match status {
        ModelStatus::Loading => "loading",
        ModelStatus::Loaded { .. } => "loaded",
        ModelStatus::Error { .. } => "error",
        ModelStatus::Unavailable { .. } => "unavailable",
    }
}

/// Load (or confirm residency of) the translation model for a pair.
///
/// The handle is released right away; the model stays resident until the
/// memory budget forces it out.
pub async fn load_model(
    state: web::Data<AppState>,
    request: web::Json<LoadModelRequest>,
) -> Result<HttpResponse, AppError> {
    let start_time = Instant::now();
    let source = LanguageTag::parse(&request.source_language)?;
    let target = LanguageTag::parse(&request.target_language)?;

    if source.same_language(&target) {
        return Err(AppError::ValidationError(format!(
            "{} to {} needs no translation model",
            source, target
        )));
    }

    let key = ModelKey::translation(LanguagePair::new(&source, &target));
    let registry = &state.services().registry;

    let handle = registry.acquire(key.clone()).await.map_err(|err| {
        let RegistryError::ModelUnavailable { standing, .. } = &err;
        tracing::warn!(model = %key, standing = *standing, error = %err, "Model load request failed");
        AppError::from(err)
    })?;
    let version = handle.version().to_string();
    registry.release(handle);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Model loaded successfully",
        "model": key.to_string(),
        "version": version,
        "load_time_seconds": start_time.elapsed().as_secs_f64(),
        "summary": registry.summary()
    })))
}
