//! `POST /api/v1/translate`: translate a piece of text without a camera.
//!
//! ```json
//! { "text": "Emergency exit", "source_language": "auto", "target_language": "fr" }
//! ```
//!
//! Both languages are optional and default to the configured pipeline
//! languages. Results share the cache with camera sessions.

use crate::language::{LanguageTag, SourceLanguage};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct TranslateTextRequest {
    pub text: String,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
}

pub async fn translate_text(
    state: web::Data<AppState>,
    request: web::Json<TranslateTextRequest>,
) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }

    let defaults = state.get_config().pipeline;
    let target = LanguageTag::parse(
        request
            .target_language
            .as_deref()
            .unwrap_or(&defaults.target_language),
    )?;
    let source: SourceLanguage = request
        .source_language
        .as_deref()
        .unwrap_or(&defaults.source_language)
        .parse()?;

    let start_time = Instant::now();
    let result = state
        .text_pipeline
        .translate_text(&request.text, source, target)
        .await?;

    tracing::debug!(
        source = %result.source_language_resolved,
        target = %result.request.target_language,
        duration_ms = start_time.elapsed().as_millis() as u64,
        "Text translated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "translated_text": result.translated_text,
        "source_language": result.source_language_resolved,
        "target_language": result.request.target_language,
        "model_version": result.model_version,
        "produced_at": result.produced_at,
        "duration_ms": start_time.elapsed().as_millis() as u64
    })))
}
