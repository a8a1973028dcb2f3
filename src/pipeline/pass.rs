//! # Pipeline Pass
//!
//! One frame's trip through the stages:
//!
//! ```text
//! Idle → Recognizing → Detecting → CacheHit ───────────────→ Publishing
//!                                → CacheMiss → Translating → Publishing
//! ```
//!
//! ending in a [`Terminal`] state. Cancellation is cooperative: the pass
//! checks its token before Recognizing, before Detecting, before the cache
//! lookup and before Translating. A stage that already started finishes,
//! but its output is discarded if the token fired meanwhile. Once a pass
//! enters Translating it is committed and runs to Published or Failed; an
//! uncommitted result (cache hit, passthrough) is dropped if the token
//! fires before it is published.

use crate::cache::ResultCache;
use crate::frame::Frame;
use crate::language::{LanguagePair, LanguageTag, SourceLanguage};
use crate::models::{ModelKey, ModelRegistry};
use crate::pipeline::stats::PipelineStats;
use crate::stages::translation::screen_input;
use crate::stages::{
    DetectionOutcome, DetectionStage, LanguageCandidate, RecognitionStage, TranslationRequest,
    TranslationResult, TranslationStage,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Kinds of pass errors reported to the result sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Frame unreadable or unsupported, or the text could not be analysed
    Recognition,
    /// Not a failure: the source language needs an answer from outside
    DetectionAmbiguous,
    /// Model download or load failed
    ModelUnavailable,
    /// Model invocation failed (after one retry) or input was rejected
    Translation,
    /// Pass exceeded its deadline
    Timeout,
    /// Informational: a newer frame took the pass's place
    CancelledBySupersession,
}

impl ErrorKind {
    /// Whether this kind is a user-facing failure.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            ErrorKind::DetectionAmbiguous | ErrorKind::CancelledBySupersession
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Recognition => "recognition_error",
            ErrorKind::DetectionAmbiguous => "detection_ambiguous",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::Translation => "translation_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CancelledBySupersession => "cancelled_by_supersession",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Recognizing,
    Detecting,
    CacheHit,
    CacheMiss,
    Translating,
    Publishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Published,
    Cancelled,
    Failed,
    /// Detection was ambiguous and no fallback language was known
    AwaitingLanguage,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Published => "published",
            Terminal::Cancelled => "cancelled",
            Terminal::Failed => "failed",
            Terminal::AwaitingLanguage => "awaiting_language",
        }
    }
}

/// Where a pass was and what it was working on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassContext {
    /// `None` for one-shot text translations
    pub frame_sequence: Option<u64>,
    pub target_language: LanguageTag,
    pub source_language: Option<LanguageTag>,
    pub state: PassState,
    pub source_text: Option<String>,
}

impl PassContext {
    pub fn for_frame(sequence: u64, target: LanguageTag) -> Self {
        Self {
            frame_sequence: Some(sequence),
            target_language: target,
            source_language: None,
            state: PassState::Idle,
            source_text: None,
        }
    }

    pub fn for_text(text: &str, target: LanguageTag) -> Self {
        Self {
            frame_sequence: None,
            target_language: target,
            source_language: None,
            state: PassState::Idle,
            source_text: Some(text.to_string()),
        }
    }
}

/// A stage error wrapped with the context of the pass that hit it.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{kind}: {message}")]
pub struct PassError {
    pub kind: ErrorKind,
    pub context: PassContext,
    pub message: String,
    /// A condition that persists until resolved, not a one-off failure
    pub standing: bool,
}

impl PassError {
    pub fn new(kind: ErrorKind, context: &PassContext, message: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.clone(),
            message: message.into(),
            standing: false,
        }
    }
}

/// Result of one frame pass, handed to the in-order dispatcher.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub sequence: u64,
    pub target: LanguageTag,
    pub terminal: Terminal,
    pub result: Option<TranslationResult>,
    pub error: Option<PassError>,
    /// Cache entry backing the published result, if any
    pub(crate) cached_request: Option<TranslationRequest>,
    /// Source language this pass detected itself
    pub(crate) detected_source: Option<LanguageTag>,
    /// Whether the pass entered Translating
    pub(crate) committed: bool,
}

impl PassOutcome {
    fn new(context: &PassContext, terminal: Terminal) -> Self {
        Self {
            sequence: context.frame_sequence.unwrap_or_default(),
            target: context.target_language.clone(),
            terminal,
            result: None,
            error: None,
            cached_request: None,
            detected_source: None,
            committed: false,
        }
    }

    pub fn cancelled(context: &PassContext) -> Self {
        Self::new(context, Terminal::Cancelled)
    }

    pub fn failed(error: PassError) -> Self {
        let mut outcome = Self::new(&error.context, Terminal::Failed);
        outcome.error = Some(error);
        outcome
    }

    fn awaiting_language(error: PassError) -> Self {
        let mut outcome = Self::new(&error.context, Terminal::AwaitingLanguage);
        outcome.error = Some(error);
        outcome
    }

    /// Final form of the outcome given the pass token: an uncommitted
    /// result whose pass was superseded is not published.
    pub(crate) fn settle(self, token: &CancellationToken) -> Self {
        if self.terminal != Terminal::Published || self.committed || !token.is_cancelled() {
            return self;
        }
        tracing::debug!(frame = self.sequence, target = %self.target, "Dropping result of a superseded pass");
        Self {
            terminal: Terminal::Cancelled,
            result: None,
            error: None,
            cached_request: None,
            detected_source: None,
            ..self
        }
    }
}

/// Why a pass stopped before publishing.
enum Stop {
    Cancelled,
    Failed(PassError),
}

/// A translation together with the cache request that now holds it.
pub(crate) struct Translated {
    pub result: TranslationResult,
    pub cached_request: Option<TranslationRequest>,
    /// Produced by a model rather than the cache or passthrough
    pub committed: bool,
}

/// The stages and shared resources every pass of a pipeline uses.
pub(crate) struct StageSet {
    pub recognition: RecognitionStage,
    pub detection: DetectionStage,
    pub translation: TranslationStage,
    pub registry: ModelRegistry,
    pub cache: Arc<ResultCache>,
    pub workers: Arc<Semaphore>,
    pub stats: Arc<PipelineStats>,
}

fn checkpoint(token: Option<&CancellationToken>, context: &mut PassContext, next: PassState) -> Result<(), Stop> {
    if token.is_some_and(|t| t.is_cancelled()) {
        tracing::debug!(frame = ?context.frame_sequence, at = ?next, "Pass superseded");
        return Err(Stop::Cancelled);
    }
    context.state = next;
    Ok(())
}

fn describe(candidates: &[LanguageCandidate]) -> String {
    if candidates.is_empty() {
        return "no language candidates".to_string();
    }
    candidates
        .iter()
        .take(3)
        .map(|c| format!("{} {:.2}", c.tag, c.confidence))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StageSet {
    /// Run `work` on one of the bounded stage workers.
    async fn on_worker<F: Future>(&self, work: F) -> Result<F::Output, Stop> {
        let _permit = self.workers.acquire().await.map_err(|_| Stop::Cancelled)?;
        Ok(work.await)
    }

    /// Run a full frame pass. `context` is updated as the pass advances so a
    /// caller that abandons the future still knows where it stopped.
    pub async fn run_frame(
        &self,
        frame: Frame,
        source_policy: &SourceLanguage,
        remembered_source: Option<LanguageTag>,
        token: &CancellationToken,
        context: &mut PassContext,
    ) -> PassOutcome {
        match self
            .frame_steps(frame, source_policy, remembered_source, token, context)
            .await
        {
            Ok(outcome) => outcome,
            Err(Stop::Cancelled) => PassOutcome::cancelled(context),
            Err(Stop::Failed(error)) if error.kind == ErrorKind::DetectionAmbiguous => {
                PassOutcome::awaiting_language(error)
            }
            Err(Stop::Failed(error)) => PassOutcome::failed(error),
        }
    }

    async fn frame_steps(
        &self,
        frame: Frame,
        source_policy: &SourceLanguage,
        remembered_source: Option<LanguageTag>,
        token: &CancellationToken,
        context: &mut PassContext,
    ) -> Result<PassOutcome, Stop> {
        checkpoint(Some(token), context, PassState::Recognizing)?;
        let recognized = self
            .on_worker(self.recognition.recognize(&frame))
            .await?
            .map_err(|e| Stop::Failed(PassError::new(ErrorKind::Recognition, context, e.to_string())))?;
        drop(frame);

        let text = recognized.text();
        context.source_text = Some(text.clone());

        let mut detected_source = None;
        let source = match source_policy {
            SourceLanguage::Tag(tag) => tag.clone(),
            SourceLanguage::Auto => {
                checkpoint(Some(token), context, PassState::Detecting)?;
                match self.detect(&text, remembered_source, context).await? {
                    (tag, true) => {
                        detected_source = Some(tag.clone());
                        tag
                    }
                    (tag, false) => tag,
                }
            }
        };

        let translated = self.translate_resolved(&text, &source, Some(token), context).await?;

        let mut outcome = PassOutcome::new(context, Terminal::Published);
        outcome.result = Some(translated.result);
        outcome.cached_request = translated.cached_request;
        outcome.committed = translated.committed;
        outcome.detected_source = detected_source;
        Ok(outcome)
    }

    /// Resolve the source language of `text`. The flag is true when the
    /// language came from detection rather than the remembered fallback.
    async fn detect(
        &self,
        text: &str,
        remembered_source: Option<LanguageTag>,
        context: &PassContext,
    ) -> Result<(LanguageTag, bool), Stop> {
        let outcome = self
            .on_worker(self.detection.detect(text))
            .await?
            .map_err(|e| Stop::Failed(PassError::new(ErrorKind::Recognition, context, e.to_string())))?;

        match outcome {
            DetectionOutcome::Detected { tag, .. } => Ok((tag, true)),
            DetectionOutcome::Ambiguous { candidates } => match remembered_source {
                Some(tag) => {
                    tracing::debug!(fallback = %tag, "Ambiguous detection, using remembered source language");
                    Ok((tag, false))
                }
                None => Err(Stop::Failed(PassError::new(
                    ErrorKind::DetectionAmbiguous,
                    context,
                    describe(&candidates),
                ))),
            },
        }
    }

    /// Cache lookup, then model acquisition and translation on a miss.
    ///
    /// Same-language text is passed through untouched without a model or
    /// the cache.
    async fn translate_resolved(
        &self,
        text: &str,
        source: &LanguageTag,
        token: Option<&CancellationToken>,
        context: &mut PassContext,
    ) -> Result<Translated, Stop> {
        context.source_language = Some(source.clone());
        let target = context.target_language.clone();
        let request = TranslationRequest::new(text, SourceLanguage::Tag(source.clone()), target.clone());

        if source.same_language(&target) {
            checkpoint(token, context, PassState::Publishing)?;
            return Ok(Translated {
                result: TranslationResult::passthrough(request, source.clone()),
                cached_request: None,
                committed: false,
            });
        }

        checkpoint(token, context, PassState::CacheMiss)?;
        if let Some(hit) = self.cache.lookup(&request) {
            self.stats.record_cache_hit();
            context.state = PassState::CacheHit;
            context.state = PassState::Publishing;
            return Ok(Translated {
                result: hit,
                cached_request: Some(request),
                committed: false,
            });
        }
        self.stats.record_cache_miss();

        // Rejected input must not cost a model download.
        screen_input(&request.source_text)
            .map_err(|e| Stop::Failed(PassError::new(ErrorKind::Translation, context, e.to_string())))?;

        checkpoint(token, context, PassState::Translating)?;
        let result = self.translate_with_retry(&request, source, context).await?;

        context.state = PassState::Publishing;
        self.cache.insert(&request, result.clone());
        Ok(Translated {
            result,
            cached_request: Some(request),
            committed: true,
        })
    }

    async fn translate_with_retry(
        &self,
        request: &TranslationRequest,
        source: &LanguageTag,
        context: &PassContext,
    ) -> Result<TranslationResult, Stop> {
        let key = ModelKey::translation(LanguagePair::new(source, &request.target_language));
        let handle = self.registry.acquire(key).await.map_err(|e| {
            let mut error = PassError::new(ErrorKind::ModelUnavailable, context, e.to_string());
            error.standing = e.is_standing();
            Stop::Failed(error)
        })?;

        let mut retried = false;
        let result = loop {
            match self
                .on_worker(self.translation.translate(request, source, &handle))
                .await?
            {
                Ok(result) => break result,
                Err(e) if e.is_retryable() && !retried => {
                    retried = true;
                    self.stats.record_translation_retry();
                    tracing::warn!(model = %handle.key(), error = %e, "Translation failed, retrying once");
                }
                Err(e) => {
                    return Err(Stop::Failed(PassError::new(ErrorKind::Translation, context, e.to_string())))
                }
            }
        };

        // The handle goes back before the result leaves the stage.
        drop(handle);
        Ok(result)
    }

    /// One-shot translation outside frame admission.
    pub async fn translate_text(
        &self,
        text: &str,
        source_policy: &SourceLanguage,
        target: LanguageTag,
    ) -> Result<TranslationResult, PassError> {
        let mut context = PassContext::for_text(text, target);

        let source = match source_policy {
            SourceLanguage::Tag(tag) => tag.clone(),
            SourceLanguage::Auto => {
                context.state = PassState::Detecting;
                match self.detect(text, None, &context).await {
                    Ok((tag, _)) => tag,
                    Err(stop) => return Err(self.stop_to_error(stop, &context)),
                }
            }
        };

        match self.translate_resolved(text, &source, None, &mut context).await {
            Ok(translated) => Ok(translated.result),
            Err(stop) => Err(self.stop_to_error(stop, &context)),
        }
    }

    fn stop_to_error(&self, stop: Stop, context: &PassContext) -> PassError {
        match stop {
            Stop::Failed(error) => error,
            Stop::Cancelled => PassError::new(
                ErrorKind::CancelledBySupersession,
                context,
                "pipeline is shutting down",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert!(ErrorKind::Recognition.is_failure());
        assert!(ErrorKind::Timeout.is_failure());
        assert!(ErrorKind::ModelUnavailable.is_failure());
        assert!(!ErrorKind::DetectionAmbiguous.is_failure());
        assert!(!ErrorKind::CancelledBySupersession.is_failure());
        assert_eq!(
            serde_json::to_string(&ErrorKind::ModelUnavailable).unwrap(),
            "\"model_unavailable\""
        );
    }

    #[test]
    fn test_checkpoint_stops_cancelled_pass() {
        let token = CancellationToken::new();
        let mut context = PassContext::for_frame(3, LanguageTag::parse("fr").unwrap());

        assert!(checkpoint(Some(&token), &mut context, PassState::Recognizing).is_ok());
        assert_eq!(context.state, PassState::Recognizing);

        token.cancel();
        assert!(checkpoint(Some(&token), &mut context, PassState::Detecting).is_err());
        assert_eq!(context.state, PassState::Recognizing);
        assert!(checkpoint(None, &mut context, PassState::Detecting).is_ok());
    }

    fn published(committed: bool) -> PassOutcome {
        let fr = LanguageTag::parse("fr").unwrap();
        let en = LanguageTag::parse("en").unwrap();
        let context = PassContext::for_frame(4, fr.clone());
        let request = TranslationRequest::new("exit", SourceLanguage::Tag(en.clone()), fr);

        let mut outcome = PassOutcome::new(&context, Terminal::Published);
        outcome.result = Some(TranslationResult::passthrough(request.clone(), en.clone()));
        outcome.cached_request = Some(request);
        outcome.detected_source = Some(en);
        outcome.committed = committed;
        outcome
    }

    #[test]
    fn test_superseded_cache_hit_is_not_published() {
        let token = CancellationToken::new();
        assert_eq!(published(false).settle(&token).terminal, Terminal::Published);

        token.cancel();
        let settled = published(false).settle(&token);
        assert_eq!(settled.terminal, Terminal::Cancelled);
        assert!(settled.result.is_none());
        assert!(settled.cached_request.is_none());
        assert!(settled.detected_source.is_none());
        assert_eq!(settled.sequence, 4);
    }

    #[test]
    fn test_committed_translation_survives_supersession() {
        let token = CancellationToken::new();
        token.cancel();
        let settled = published(true).settle(&token);
        assert_eq!(settled.terminal, Terminal::Published);
        assert!(settled.result.is_some());
    }
}
