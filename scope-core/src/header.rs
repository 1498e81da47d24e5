//! Binary-channel frame header.
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────
//!      0     4  payload size   (u32 LE)
//!      4    12  reserved
//!     16     4  message id     (u32 LE)
//!     20    24  reserved
//!     44     4  image width    (u32 LE)
//!     48     4  image height   (u32 LE)
//!     52    28  reserved
//! ```
//!
//! Reserved bytes are zero when encoding and ignored when decoding.

use crate::error::ScopeError;

/// Length of every binary frame header on the wire.
pub const HEADER_SIZE: usize = 80;

const SIZE_OFFSET: usize = 0;
const ID_OFFSET: usize = 16;
const WIDTH_OFFSET: usize = 44;
const HEIGHT_OFFSET: usize = 48;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

/// Decoded binary frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub payload_size: u32,
    pub message_id: u32,
    pub width: u32,
    pub height: u32,
}

impl FrameHeader {
    pub fn new(payload_size: u32, message_id: u32, width: u32, height: u32) -> Self {
        Self {
            payload_size,
            message_id,
            width,
            height,
        }
    }

    /// Parse a header. The buffer must be exactly [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ScopeError> {
        if bytes.len() != HEADER_SIZE {
            return Err(ScopeError::InvalidHeader {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            payload_size: read_u32(bytes, SIZE_OFFSET),
            message_id: read_u32(bytes, ID_OFFSET),
            width: read_u32(bytes, WIDTH_OFFSET),
            height: read_u32(bytes, HEIGHT_OFFSET),
        })
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut out: FrameHeaderBytes = [0; HEADER_SIZE];
        out[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&self.payload_size.to_le_bytes());
        out[ID_OFFSET..ID_OFFSET + 4].copy_from_slice(&self.message_id.to_le_bytes());
        out[WIDTH_OFFSET..WIDTH_OFFSET + 4].copy_from_slice(&self.width.to_le_bytes());
        out[HEIGHT_OFFSET..HEIGHT_OFFSET + 4].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    /// Zero width or height means the payload is not an image.
    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_documented_offsets() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&10_000u32.to_le_bytes());
        raw[16..20].copy_from_slice(&7u32.to_le_bytes());
        raw[44..48].copy_from_slice(&1920u32.to_le_bytes());
        raw[48..52].copy_from_slice(&1080u32.to_le_bytes());
        // reserved bytes are ignored
        raw[4] = 0xAA;
        raw[60] = 0x55;

        let header = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header, FrameHeader::new(10_000, 7, 1920, 1080));
        assert!(header.has_dimensions());
    }

    #[test]
    fn to_bytes_matches_parse() {
        let header = FrameHeader::new(u32::MAX, 0xDEAD_BEEF, 3840, 2160);
        let raw = header.to_bytes();
        assert_eq!(raw.len(), HEADER_SIZE);
        assert_eq!(&raw[16..20], &0xDEAD_BEEFu32.to_le_bytes());
        assert!(raw[52..].iter().all(|b| *b == 0));
        assert_eq!(FrameHeader::parse(&raw).unwrap(), header);
    }

    #[test]
    fn short_buffer_rejected() {
        let err = FrameHeader::parse(&[0u8; 79]).unwrap_err();
        assert!(matches!(
            err,
            ScopeError::InvalidHeader {
                expected: 80,
                actual: 79
            }
        ));
        assert!(FrameHeader::parse(&[]).is_err());
    }

    #[test]
    fn long_buffer_rejected() {
        assert!(FrameHeader::parse(&[0u8; 81]).is_err());
    }

    #[test]
    fn zero_dimensions() {
        let header = FrameHeader::new(11, 2, 0, 0);
        assert!(!header.has_dimensions());
        assert!(!FrameHeader::new(11, 2, 640, 0).has_dimensions());
    }
}
