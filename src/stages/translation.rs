//! # Translation Stage
//!
//! Translates recognized text with a model borrowed from the
//! [`ModelRegistry`](crate::models::ModelRegistry).
//!
//! The stage never touches the result cache; it hands the
//! [`TranslationResult`] back to the caller, which decides whether to store
//! it. Inputs are screened before any model is invoked:
//! - empty text and text over [`MAX_TEXT_LENGTH`] characters are rejected
//! - text carrying script-injection markers is rejected
//!
//! Rejections are `InvalidInput` and are never retried.

use crate::language::{LanguagePair, LanguageTag, SourceLanguage};
use crate::models::ModelHandle;
use crate::stages::MAX_TEXT_LENGTH;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const SUSPICIOUS_MARKERS: [&str; 4] = ["<script", "javascript:", "data:", "vbscript:"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("translation model invocation failed: {0}")]
    Invocation(String),

    #[error("invalid translation input: {0}")]
    InvalidInput(String),

    #[error("model {model} cannot translate {pair}")]
    IncompatibleModel { model: String, pair: String },
}

impl TranslationError {
    /// Only invocation failures are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TranslationError::Invocation(_))
    }
}

/// What to translate and into which language.
///
/// `source_text` keeps its display casing; cache keys normalize it separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub source_text: String,
    pub source_language: SourceLanguage,
    pub target_language: LanguageTag,
}

impl TranslationRequest {
    pub fn new(
        source_text: impl Into<String>,
        source_language: SourceLanguage,
        target_language: LanguageTag,
    ) -> Self {
        Self {
            source_text: source_text.into(),
            source_language,
            target_language,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub request: TranslationRequest,
    pub translated_text: String,
    pub source_language_resolved: LanguageTag,
    pub produced_at: DateTime<Utc>,
    /// Version of the model that produced the text; `None` for passthrough
    #[serde(default)]
    pub model_version: Option<String>,
}

impl TranslationResult {
    /// Result for text already in the target language.
    pub fn passthrough(request: TranslationRequest, source: LanguageTag) -> Self {
        Self {
            translated_text: request.source_text.clone(),
            request,
            source_language_resolved: source,
            produced_at: Utc::now(),
            model_version: None,
        }
    }
}

/// Translation capability provider.
///
/// The handle's instance is whatever the provisioner loaded; a translator
/// downcasts it and reports `IncompatibleModel` when the type is foreign.
#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(
        &self,
        text: &str,
        pair: &LanguagePair,
        model: &ModelHandle,
    ) -> Result<String, TranslationError>;
}

pub struct TranslationStage {
    translator: Arc<dyn Translator>,
}

impl TranslationStage {
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self { translator }
    }

    /// Translate `request` from the resolved `source` language.
    pub async fn translate(
        &self,
        request: &TranslationRequest,
        source: &LanguageTag,
        handle: &ModelHandle,
    ) -> Result<TranslationResult, TranslationError> {
        screen_input(&request.source_text)?;

        let pair = LanguagePair::new(source, &request.target_language);
        let translated_text = self
            .translator
            .translate(&request.source_text, &pair, handle)
            .await?;

        tracing::debug!(
            pair = %pair,
            translator = self.translator.name(),
            model_version = handle.version(),
            chars = request.source_text.chars().count(),
            "Translated text"
        );

        Ok(TranslationResult {
            request: request.clone(),
            translated_text,
            source_language_resolved: source.clone(),
            produced_at: Utc::now(),
            model_version: Some(handle.version().to_string()),
        })
    }
}

/// Reject inputs no model should see.
pub fn screen_input(text: &str) -> Result<(), TranslationError> {
    if text.trim().is_empty() {
        return Err(TranslationError::InvalidInput("text is empty".to_string()));
    }

    let length = text.chars().count();
    if length > MAX_TEXT_LENGTH {
        return Err(TranslationError::InvalidInput(format!(
            "text is {} characters (maximum {})",
            length, MAX_TEXT_LENGTH
        )));
    }

    let lowered = text.to_lowercase();
    if let Some(marker) = SUSPICIOUS_MARKERS.iter().find(|m| lowered.contains(*m)) {
        return Err(TranslationError::InvalidInput(format!(
            "text contains suspicious content '{}'",
            marker
        )));
    }

    Ok(())
}
