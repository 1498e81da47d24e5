//! Binary-channel frame decoding.
//!
//! Each frame is an 80-byte [`FrameHeader`] followed by exactly
//! `payload_size` bytes, either a JPEG image or a UTF-8 JSON control
//! message. This decoder is stateless. The imaging client does the
//! reading and calls in here once per frame.

use image::{ImageFormat, RgbImage};
use tracing::{trace, warn};

use crate::error::ScopeError;
use crate::header::FrameHeader;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// One decoded frame. `image` is `None` when the payload carried no
/// pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeImage {
    pub width: u32,
    pub height: u32,
    pub image: Option<RgbImage>,
}

impl ScopeImage {
    /// Shape as `(rows, columns, channels)`.
    pub fn shape(&self) -> Option<(usize, usize, usize)> {
        self.image
            .as_ref()
            .map(|img| (img.height() as usize, img.width() as usize, 3))
    }

    pub fn has_pixels(&self) -> bool {
        self.image.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryProtocol;

impl BinaryProtocol {
    pub fn new() -> Self {
        Self
    }

    /// See [`FrameHeader::parse`].
    pub fn parse_header(&self, bytes: &[u8]) -> Result<FrameHeader, ScopeError> {
        FrameHeader::parse(bytes)
    }

    pub fn is_jpeg(&self, payload: &[u8]) -> bool {
        payload.len() >= 4 && payload.starts_with(&JPEG_SOI)
    }

    /// Decode a frame payload.
    ///
    /// JPEG payloads become an RGB [`ScopeImage`]; anything else returns
    /// `Ok(None)` and is left to the caller to parse as JSON. A payload
    /// that claims to be JPEG but does not decode is an error.
    pub fn handle_incoming_message(
        &self,
        width: u32,
        height: u32,
        payload: &[u8],
        message_id: u32,
    ) -> Result<Option<ScopeImage>, ScopeError> {
        if !self.is_jpeg(payload) {
            trace!(message_id, len = payload.len(), "non-image frame");
            return Ok(None);
        }

        let decoded = image::load_from_memory_with_format(payload, ImageFormat::Jpeg)?.to_rgb8();
        let (w, h) = decoded.dimensions();
        if (width, height) != (w, h) && width != 0 {
            warn!(
                message_id,
                "header says {width}x{height}, image decodes as {w}x{h}"
            );
        }
        trace!(message_id, w, h, "decoded frame");
        Ok(Some(ScopeImage {
            width: w,
            height: h,
            image: Some(decoded),
        }))
    }
}

// ── Tests ────────────────────────────────────────────────────────
