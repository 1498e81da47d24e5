//! Device operating mode as tracked by the clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What the telescope is currently doing, which decides how images are
/// delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClientMode {
    Idle,
    ContinuousExposure,
    Stacking,
    Streaming,
    AutoFocus,
    /// A mode name this library does not know about.
    Other(String),
}

impl ClientMode {
    /// Parse a mode or view-stage name as reported by the device.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Idle" => Self::Idle,
            "ContinuousExposure" => Self::ContinuousExposure,
            "Stack" | "Stacking" => Self::Stacking,
            "Streaming" | "RTSP" => Self::Streaming,
            "AutoFocus" => Self::AutoFocus,
            other => Self::Other(other.to_string()),
        }
    }

    /// Mode implied by a `View` stage and its state.
    ///
    /// A working stage names the mode; a finished one drops back to Idle.
    /// `None` when the pair carries no mode information.
    pub fn from_view(stage: Option<&str>, state: Option<&str>) -> Option<Self> {
        match state {
            Some("working" | "start") => stage.map(Self::from_name),
            Some("complete" | "fail" | "cancel" | "idle" | "stopped") => Some(Self::Idle),
            _ => stage.filter(|s| *s == "Idle").map(|_| Self::Idle),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::ContinuousExposure => "ContinuousExposure",
            Self::Stacking => "Stacking",
            Self::Streaming => "Streaming",
            Self::AutoFocus => "AutoFocus",
            Self::Other(name) => name,
        }
    }

    /// Modes in which the imaging channel has something to deliver.
    /// An allow-list: unknown modes are inactive.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::ContinuousExposure | Self::Streaming | Self::Stacking | Self::AutoFocus
        )
    }

    /// Modes whose frames arrive on the binary channel stream.
    pub fn wants_frame_stream(&self) -> bool {
        matches!(self, Self::ContinuousExposure | Self::Stacking)
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ClientMode {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<ClientMode> for String {
    fn from(mode: ClientMode) -> Self {
        mode.as_str().to_string()
    }
}
