//! # Camera Frames
//!
//! Immutable image frames handed from the Frame Source to the pipeline, and
//! the binary envelope camera clients use to ship them over the WebSocket.
//!
//! ## Envelope Layout (little-endian):
//! | field          | type |
//! |----------------|------|
//! | sequence       | u64  |
//! | captured_at_ms | u64  |
//! | format         | u8   |
//! | width          | u32  |
//! | height         | u32  |
//! | payload        | rest |

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::sync::Arc;
use thiserror::Error;

/// Size of the fixed envelope header in bytes.
pub const ENVELOPE_HEADER_LEN: usize = 8 + 8 + 1 + 4 + 4;

/// Largest accepted width or height.
pub const MAX_FRAME_DIMENSION: u32 = 4096;

/// Payload encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// Pre-segmented text blocks (JSON) from an on-device text detector
    TextLayer,
    /// 8-bit grayscale pixels
    Gray8,
    /// 8-bit RGBA pixels
    Rgba8,
    /// Compressed JPEG image
    Jpeg,
}

impl FrameFormat {
    /// Bytes per pixel for raw pixel formats.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            FrameFormat::Gray8 => Some(1),
            FrameFormat::Rgba8 => Some(4),
            FrameFormat::TextLayer | FrameFormat::Jpeg => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            FrameFormat::TextLayer => 0,
            FrameFormat::Gray8 => 1,
            FrameFormat::Rgba8 => 2,
            FrameFormat::Jpeg => 3,
        }
    }
}

impl TryFrom<u8> for FrameFormat {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(FrameFormat::TextLayer),
            1 => Ok(FrameFormat::Gray8),
            2 => Ok(FrameFormat::Rgba8),
            3 => Ok(FrameFormat::Jpeg),
            other => Err(FrameError::UnknownFormat(other)),
        }
    }
}

/// Reasons a frame cannot be decoded or is structurally unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("envelope too short: {0} bytes (header is {ENVELOPE_HEADER_LEN})")]
    Truncated(usize),

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("unknown frame format code {0}")]
    UnknownFormat(u8),

    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("payload is {actual} bytes, expected {expected} for {width}x{height}")]
    PayloadMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("frame payload is empty")]
    EmptyPayload,
}

/// One captured camera image with sequencing metadata.
///
/// Cloning is cheap: the payload is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    sequence: u64,
    captured_at_ms: u64,
    format: FrameFormat,
    width: u32,
    height: u32,
    data: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        sequence: u64,
        captured_at_ms: u64,
        format: FrameFormat,
        width: u32,
        height: u32,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            sequence,
            captured_at_ms,
            format,
            width,
            height,
            data: data.into(),
        }
    }

    /// Convenience constructor for a text-layer frame.
    pub fn text_layer(sequence: u64, captured_at_ms: u64, width: u32, height: u32, json: &str) -> Self {
        Self::new(
            sequence,
            captured_at_ms,
            FrameFormat::TextLayer,
            width,
            height,
            json.as_bytes().to_vec(),
        )
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Check that dimensions and payload are internally consistent.
    pub fn validate(&self) -> Result<(), FrameError> {
        let dims_ok = (1..=MAX_FRAME_DIMENSION).contains(&self.width)
            && (1..=MAX_FRAME_DIMENSION).contains(&self.height);
        if !dims_ok {
            return Err(FrameError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }

        if self.data.is_empty() {
            return Err(FrameError::EmptyPayload);
        }

        if let Some(bpp) = self.format.bytes_per_pixel() {
            let expected = self.width as usize * self.height as usize * bpp;
            if self.data.len() != expected {
                return Err(FrameError::PayloadMismatch {
                    width: self.width,
                    height: self.height,
                    expected,
                    actual: self.data.len(),
                });
            }
        }

        Ok(())
    }

    /// Decode a binary envelope received from a camera client.
    pub fn decode_envelope(bytes: &[u8], max_bytes: usize) -> Result<Self, FrameError> {
        if bytes.len() > max_bytes {
            return Err(FrameError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }

        let mut cursor = Cursor::new(bytes);
        let truncated = |_| FrameError::Truncated(bytes.len());
        let sequence = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let captured_at_ms = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let format = FrameFormat::try_from(cursor.read_u8().map_err(truncated)?)?;
        let width = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let height = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

        let mut payload = Vec::with_capacity(bytes.len() - ENVELOPE_HEADER_LEN);
        cursor.read_to_end(&mut payload).map_err(truncated)?;

        Ok(Self::new(sequence, captured_at_ms, format, width, height, payload))
    }

    /// Encode this frame as a binary envelope.
    pub fn encode_envelope(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.data.len());
        // Writes into a Vec cannot fail.
        let _ = out.write_u64::<LittleEndian>(self.sequence);
        let _ = out.write_u64::<LittleEndian>(self.captured_at_ms);
        let _ = out.write_u8(self.format.code());
        let _ = out.write_u32::<LittleEndian>(self.width);
        let _ = out.write_u32::<LittleEndian>(self.height);
        out.extend_from_slice(&self.data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decode() {
        let frame = Frame::text_layer(7, 1_700_000_000_000, 640, 480, r#"[{"text":"EXIT"}]"#);
        let bytes = frame.encode_envelope();
        assert_eq!(bytes.len(), ENVELOPE_HEADER_LEN + 17);

        let decoded = Frame::decode_envelope(&bytes, 1024).unwrap();
        assert_eq!(decoded.sequence(), 7);
        assert_eq!(decoded.captured_at_ms(), 1_700_000_000_000);
        assert_eq!(decoded.format(), FrameFormat::TextLayer);
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
        assert_eq!(decoded.data(), br#"[{"text":"EXIT"}]"#);
    }

    #[test]
    fn test_envelope_rejects_bad_input() {
        assert_eq!(Frame::decode_envelope(&[0u8; 10], 1024), Err(FrameError::Truncated(10)));

        let mut bytes = Frame::text_layer(1, 0, 10, 10, "[]").encode_envelope();
        assert!(matches!(
            Frame::decode_envelope(&bytes, 8),
            Err(FrameError::TooLarge { .. })
        ));

        bytes[16] = 9;
        assert_eq!(Frame::decode_envelope(&bytes, 1024), Err(FrameError::UnknownFormat(9)));
    }

    #[test]
    fn test_frame_validation() {
        let ok = Frame::new(1, 0, FrameFormat::Gray8, 2, 2, vec![0u8; 4]);
        assert!(ok.validate().is_ok());

        let short = Frame::new(1, 0, FrameFormat::Rgba8, 2, 2, vec![0u8; 4]);
        assert!(matches!(short.validate(), Err(FrameError::PayloadMismatch { expected: 16, .. })));

        let huge = Frame::new(1, 0, FrameFormat::Jpeg, 5000, 10, vec![1u8; 4]);
        assert!(matches!(huge.validate(), Err(FrameError::InvalidDimensions { .. })));

        let empty = Frame::new(1, 0, FrameFormat::TextLayer, 10, 10, Vec::new());
        assert_eq!(empty.validate(), Err(FrameError::EmptyPayload));
    }
}
