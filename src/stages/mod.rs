//! # Pipeline Stages
//!
//! Adapters around the three capability providers a pipeline pass invokes:
//!
//! - **recognition**: frame → reading-ordered text blocks
//! - **detection**: text → language tag, or `Ambiguous`
//! - **translation**: text + loaded model → translated text
//!
//! plus **summarization**, which condenses longer text before it is
//! translated.
//!
//! Each stage owns the policy around its provider (cleanup, ambiguity
//! margin, input guards) so providers stay thin and swappable.

pub mod detection;
pub mod recognition;
pub mod summarization;
pub mod translation;

pub use detection::{
    DetectionError, DetectionOutcome, DetectionStage, LanguageCandidate, LanguageIdentifier,
    ScriptLanguageIdentifier,
};
pub use recognition::{
    BoundingBox, RecognitionError, RecognitionStage, RecognizedText, TextBlock, TextLayerRecognizer,
    TextRecognizer,
};
pub use summarization::{summarize, SummarizationError, Summary, SummaryMode};
pub use translation::{
    TranslationError, TranslationRequest, TranslationResult, TranslationStage, Translator,
};

/// Longest text (in characters) a single pass recognizes or translates.
pub const MAX_TEXT_LENGTH: usize = 5000;
