//! RTSP frame delivery seam.
//!
//! In streaming mode the device serves video over RTSP instead of the
//! binary channel. This crate does not decode RTSP itself; an
//! [`RtspConnector`] installed on the imaging client supplies frames.

use async_trait::async_trait;

use crate::error::ScopeError;
use crate::protocol::ScopeImage;

/// An open RTSP session yielding decoded frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Result<Option<ScopeImage>, ScopeError>;
}

/// Opens RTSP sessions.
#[async_trait]
pub trait RtspConnector: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, ScopeError>;
}

/// `rtsp://{host}:{base_port + camera_id}/stream`
pub fn stream_uri(host: &str, base_port: u16, camera_id: u16) -> String {
    format!("rtsp://{host}:{}/stream", base_port.saturating_add(camera_id))
}
