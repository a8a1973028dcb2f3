//! `POST /api/v1/summarize`: condense recognized text and translate the summary.
//!
//! ```json
//! { "text": "...", "mode": "bullet_points", "target_language": "fr" }
//! ```
//!
//! `mode` defaults to `brief`. The summary is read as English unless
//! `source_language` says otherwise; the target defaults to the configured
//! pipeline target. A summary whose translation fails comes back
//! untranslated with `translated: false`.

use crate::language::{LanguageTag, SourceLanguage};
use crate::stages::SummaryMode;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

const DEFAULT_SUMMARY_SOURCE: &str = "en";

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    pub text: String,
    #[serde(default)]
    pub mode: SummaryMode,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
}

pub async fn summarize_text(
    state: web::Data<AppState>,
    request: web::Json<SummarizeRequest>,
) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::ValidationError("No text available to summarize".to_string()));
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
        .unwrap_or(DEFAULT_SUMMARY_SOURCE)
        .parse()?;

    let start_time = Instant::now();
    let summary = state
        .text_pipeline
        .summarize_text(&request.text, request.mode, source, target)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "summary": summary.text,
        "original_summary": summary.original,
        "mode": summary.mode,
        "target_language": summary.target_language,
        "translated": summary.translated,
        "translation_error": summary.translation_error,
        "duration_ms": start_time.elapsed().as_millis() as u64
    })))
}
