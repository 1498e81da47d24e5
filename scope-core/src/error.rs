//! Domain-specific error types for the telescope client stack.
//!
//! All fallible operations return `Result<T, ScopeError>`.
//! Every variant maps onto one of four broad categories, see [`ErrorKind`].

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the text and imaging channels.
#[derive(Debug, Error)]
pub enum ScopeError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The remote end actively refused the TCP connection.
    #[error("connection to {target} refused")]
    Refused { target: String },

    /// Connecting failed for a reason other than refusal or timeout.
    #[error("failed to connect to {target}: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP/IO layer reported an error on an open stream.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The link dropped while a call was waiting on it.
    #[error("connection lost")]
    ConnectionLost,

    // ── Timeout Errors ───────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    // ── Protocol Errors ──────────────────────────────────────────
    /// A binary frame header had the wrong length.
    #[error("invalid frame header: expected {expected} bytes, got {actual}")]
    InvalidHeader { expected: usize, actual: usize },

    /// A binary frame announced more payload than we accept.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The byte stream is no longer aligned on frame boundaries.
    #[error("stream desynchronized: {0}")]
    Desync(String),

    /// A JPEG payload could not be decoded.
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// JSON was expected but could not be parsed.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// A text line was not valid UTF-8.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The device answered a command with an error reply.
    #[error("device rejected `{method}`: {message}")]
    Rejected {
        method: String,
        code: Option<i64>,
        message: String,
    },

    // ── State Errors ─────────────────────────────────────────────
    /// A write or command was attempted with no open stream.
    #[error("not connected")]
    NotConnected,

    /// The owning client was explicitly disconnected.
    #[error("client disconnected")]
    Disconnected,

    /// Reconnection hit its attempt bound.
    #[error("reconnection gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Reconnection was stopped by the caller's predicate.
    #[error("reconnection aborted after {attempts} attempts")]
    ReconnectAborted { attempts: u32 },

    /// A completion channel was dropped before it was filled.
    #[error("channel closed")]
    ChannelClosed,

    /// `open` was called on a connection that already has a live stream.
    #[error("already connected to {target}")]
    AlreadyConnected { target: String },

    /// A sequence control call that does not fit the current run state.
    #[error("cannot {action} a sequence that is {state}")]
    SequenceState { action: &'static str, state: String },

    /// A sequence or step failed validation.
    #[error("invalid sequence: {0}")]
    InvalidSequence(String),

    /// A sequence step needs a collaborator the run was not given.
    #[error("no {0} available to the sequence")]
    MissingContext(&'static str),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── ErrorKind ────────────────────────────────────────────────────

/// Coarse classification used by callers that only care about the
/// failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    State,
}

impl ScopeError {
    /// The broad category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Refused { .. }
            | Self::ConnectFailed { .. }
            | Self::Transport(_)
            | Self::ConnectionLost => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidHeader { .. }
            | Self::PayloadTooLarge { .. }
            | Self::Desync(_)
            | Self::ImageDecode(_)
            | Self::Json(_)
            | Self::InvalidUtf8(_)
            | Self::ProtocolViolation(_)
            | Self::Rejected { .. } => ErrorKind::Protocol,
            Self::NotConnected
            | Self::Disconnected
            | Self::ReconnectExhausted { .. }
            | Self::ReconnectAborted { .. }
            | Self::ChannelClosed
            | Self::AlreadyConnected { .. }
            | Self::SequenceState { .. }
            | Self::InvalidSequence(_)
            | Self::MissingContext(_)
            | Self::Other(_) => ErrorKind::State,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for ScopeError {
    fn from(s: String) -> Self {
        ScopeError::Other(s)
    }
}

impl From<&str> for ScopeError {
    fn from(s: &str) -> Self {
        ScopeError::Other(s.to_string())
    }
}

impl From<image::ImageError> for ScopeError {
    fn from(e: image::ImageError) -> Self {
        ScopeError::ImageDecode(e.to_string())
    }
}
