//! Client lifecycle phase.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ◄──► Reconnecting
//!       ▲                │              │               │
//!       └────────────────┴──────────────┴───────────────┘
//! ```
//!
//! `Disconnected` is terminal after an explicit disconnect or once
//! reconnection has given up.

use std::time::{Duration, Instant};

// ── ClientState ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientState {
    /// No link. Initial and terminal state.
    #[default]
    Disconnected,

    /// First `open()` in progress.
    Connecting,

    /// Link up; background tasks running.
    Connected {
        /// When the client (re)entered `Connected`.
        since: Instant,
    },

    /// Link lost; the monitor is retrying with backoff.
    Reconnecting,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

impl ClientState {
    pub fn connected_now() -> Self {
        Self::Connected {
            since: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the client has been connected. `None` in any other phase.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
