//! # Recognition Stage
//!
//! Turns a [`Frame`] into [`RecognizedText`]: reading-ordered, cleaned-up
//! text blocks with confidences.
//!
//! ## Stage Policy (applied to whatever the provider returns):
//! 1. Reject structurally unreadable frames before calling the provider
//! 2. Trim each block and collapse runs of whitespace, dropping empty blocks
//! 3. Order blocks top-to-bottom, then left-to-right within a visual line
//! 4. Cap the concatenated text at [`MAX_TEXT_LENGTH`] characters
//!
//! Ordering is part of the contract: the translation unit is the blocks
//! joined with `\n` in exactly this order.

use crate::frame::{Frame, FrameError, FrameFormat};
use crate::stages::MAX_TEXT_LENGTH;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    #[error("unsupported frame format {0:?}")]
    UnsupportedFormat(FrameFormat),

    #[error("frame unreadable: {0}")]
    Unreadable(String),

    #[error("No text detected in image")]
    NoText,

    #[error("recognizer failed: {0}")]
    Provider(String),
}

impl From<FrameError> for RecognitionError {
    fn from(err: FrameError) -> Self {
        RecognitionError::Unreadable(err.to_string())
    }
}

/// Axis-aligned region of a text block, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Two boxes sit on the same visual line when they overlap vertically by
    /// at least half the height of the shorter one.
    fn shares_line_with(&self, other: &BoundingBox) -> bool {
        let overlap = self.bottom().min(other.bottom()) - self.y.max(other.y);
        overlap >= self.height.min(other.height) * 0.5
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub bounds: BoundingBox,
    /// Provider confidence in `[0, 1]`
    pub confidence: f32,
}

impl TextBlock {
    pub fn new(text: impl Into<String>, bounds: BoundingBox, confidence: f32) -> Self {
        Self {
            text: text.into(),
            bounds,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Text recognized from exactly one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedText {
    pub frame_sequence: u64,
    pub blocks: Vec<TextBlock>,
}

impl RecognizedText {
    /// Blocks joined in reading order, one per line.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Mean block confidence.
    pub fn confidence(&self) -> f32 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        self.blocks.iter().map(|b| b.confidence).sum::<f32>() / self.blocks.len() as f32
    }
}

/// OCR capability provider.
///
/// Implementations only extract raw blocks; ordering and cleanup belong to
/// [`RecognitionStage`].
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, frame: &Frame) -> Result<Vec<TextBlock>, RecognitionError>;
}

pub struct RecognitionStage {
    recognizer: Arc<dyn TextRecognizer>,
}

impl RecognitionStage {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { recognizer }
    }

    pub fn provider_name(&self) -> &str {
        self.recognizer.name()
    }

    pub async fn recognize(&self, frame: &Frame) -> Result<RecognizedText, RecognitionError> {
        frame.validate()?;

        let raw = self.recognizer.recognize(frame).await?;
        let provided = raw.len();

        let cleaned: Vec<TextBlock> = raw
            .into_iter()
            .filter_map(|mut block| {
                block.text = collapse_whitespace(&block.text);
                block.confidence = block.confidence.clamp(0.0, 1.0);
                (!block.text.is_empty()).then_some(block)
            })
            .collect();

        if cleaned.is_empty() {
            return Err(RecognitionError::NoText);
        }

        let blocks = truncate_blocks(reading_order(cleaned), MAX_TEXT_LENGTH);

        tracing::debug!(
            frame = frame.sequence(),
            provider = self.recognizer.name(),
            provided,
            kept = blocks.len(),
            "Recognized text blocks"
        );

        Ok(RecognizedText {
            frame_sequence: frame.sequence(),
            blocks,
        })
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sort blocks top-to-bottom, grouping vertically overlapping blocks into a
/// line that is then read left-to-right.
fn reading_order(mut blocks: Vec<TextBlock>) -> Vec<TextBlock> {
    blocks.sort_by(|a, b| {
        a.bounds
            .y
            .total_cmp(&b.bounds.y)
            .then(a.bounds.x.total_cmp(&b.bounds.x))
    });

    let mut lines: Vec<Vec<TextBlock>> = Vec::new();
    for block in blocks {
        match lines.last_mut() {
            Some(line) if line.iter().any(|b| b.bounds.shares_line_with(&block.bounds)) => {
                line.push(block)
            }
            _ => lines.push(vec![block]),
        }
    }

    lines
        .into_iter()
        .flat_map(|mut line| {
            line.sort_by(|a, b| a.bounds.x.total_cmp(&b.bounds.x));
            line
        })
        .collect()
}

/// Keep blocks until the `\n`-joined text would exceed `limit` characters,
/// cutting the last kept block short if needed.
fn truncate_blocks(blocks: Vec<TextBlock>, limit: usize) -> Vec<TextBlock> {
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(blocks.len());

    for mut block in blocks {
        let separator = usize::from(!kept.is_empty());
        let remaining = limit.saturating_sub(used + separator);
        if remaining == 0 {
            break;
        }

        let len = block.text.chars().count();
        if len > remaining {
            block.text = block.text.chars().take(remaining).collect::<String>().trim_end().to_string();
            if !block.text.is_empty() {
                kept.push(block);
            }
            break;
        }

        used += separator + len;
        kept.push(block);
    }

    kept
}

/// Wire shape of one block inside a `TextLayer` payload.
#[derive(Debug, Deserialize)]
struct LayerBlock {
    text: String,
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
    #[serde(default)]
    width: f32,
    #[serde(default)]
    height: f32,
    #[serde(default = "full_confidence")]
    confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LayerPayload {
    Blocks(Vec<LayerBlock>),
    Wrapped { blocks: Vec<LayerBlock> },
}

/// Reads text blocks that an on-device detector already segmented.
///
/// Pixel formats are rejected: running OCR over raw pixels is the job of
/// an external recognizer plugged in through [`TextRecognizer`].
#[derive(Debug, Default, Clone)]
pub struct TextLayerRecognizer;

#[async_trait]
impl TextRecognizer for TextLayerRecognizer {
    fn name(&self) -> &str {
        "text-layer"
    }

    async fn recognize(&self, frame: &Frame) -> Result<Vec<TextBlock>, RecognitionError> {
        if frame.format() != FrameFormat::TextLayer {
            return Err(RecognitionError::UnsupportedFormat(frame.format()));
        }

        let payload: LayerPayload = serde_json::from_slice(frame.data())
            .map_err(|e| RecognitionError::Unreadable(format!("bad text layer: {}", e)))?;

        let blocks = match payload {
            LayerPayload::Blocks(blocks) | LayerPayload::Wrapped { blocks } => blocks,
        };

        Ok(blocks
            .into_iter()
            .map(|b| TextBlock::new(b.text, BoundingBox::new(b.x, b.y, b.width, b.height), b.confidence))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> RecognitionStage {
        RecognitionStage::new(Arc::new(TextLayerRecognizer))
    }

    #[tokio::test]
    async fn test_reading_order_top_to_bottom_then_left_to_right() {
        let json = r#"[
            {"text": "WORLD", "x": 120, "y": 12, "width": 80, "height": 20},
            {"text": "FOOTER", "x": 0, "y": 200, "width": 80, "height": 20},
            {"text": "HELLO", "x": 10, "y": 10, "width": 80, "height": 20}
        ]"#;
        let frame = Frame::text_layer(1, 0, 640, 480, json);

        let recognized = stage().recognize(&frame).await.unwrap();
        assert_eq!(recognized.frame_sequence, 1);
        assert_eq!(recognized.text(), "HELLO\nWORLD\nFOOTER");
    }

    #[tokio::test]
    async fn test_cleanup_and_empty_frames() {
        let json = r#"{"blocks": [{"text": "  Pull \t  here  ", "confidence": 0.8}, {"text": "   "}]}"#;
        let recognized = stage()
            .recognize(&Frame::text_layer(2, 0, 100, 100, json))
            .await
            .unwrap();
        assert_eq!(recognized.text(), "Pull here");
        assert!((recognized.confidence() - 0.8).abs() < f32::EPSILON);

        let empty = stage().recognize(&Frame::text_layer(3, 0, 100, 100, r#"[{"text": " "}]"#)).await;
        assert_eq!(empty, Err(RecognitionError::NoText));
    }

    #[tokio::test]
    async fn test_unreadable_and_unsupported_frames() {
        let corrupt = stage().recognize(&Frame::text_layer(1, 0, 10, 10, "{not json")).await;
        assert!(matches!(corrupt, Err(RecognitionError::Unreadable(_))));

        let bad_dims = stage().recognize(&Frame::text_layer(1, 0, 0, 10, "[]")).await;
        assert!(matches!(bad_dims, Err(RecognitionError::Unreadable(_))));

        let pixels = Frame::new(1, 0, FrameFormat::Gray8, 2, 2, vec![0u8; 4]);
        assert_eq!(
            stage().recognize(&pixels).await,
            Err(RecognitionError::UnsupportedFormat(FrameFormat::Gray8))
        );
    }

    #[test]
    fn test_truncation_caps_joined_text() {
        let blocks = vec![
            TextBlock::new("abcd", BoundingBox::default(), 1.0),
            TextBlock::new("efghij", BoundingBox::default(), 1.0),
            TextBlock::new("never", BoundingBox::default(), 1.0),
        ];
        let kept = truncate_blocks(blocks, 8);
        let joined: Vec<_> = kept.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(joined, vec!["abcd", "efg"]);
    }
}
