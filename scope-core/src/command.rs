//! Commands written to the device.
//!
//! Domain commands are opaque to this crate: anything with a method name
//! and optional params can be sent. The handful of commands the clients
//! issue themselves are defined here.

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::ScopeError;

/// A request the device understands.
pub trait Command: Send + Sync {
    /// JSON-RPC method name.
    fn method(&self) -> &str;

    /// Request parameters. `None` omits the field from the wire.
    fn params(&self) -> Option<Value> {
        None
    }
}

/// Wire form of one request line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> CommandRequest<'a> {
    pub fn new(id: u64, command: &'a dyn Command) -> Self {
        Self {
            id,
            method: command.method(),
            params: command.params(),
        }
    }

    /// Serialize as one `\r\n`-terminated line.
    pub fn to_line(&self) -> Result<String, ScopeError> {
        let mut line = serde_json::to_string(self)?;
        line.push_str("\r\n");
        Ok(line)
    }
}

// ── Built-in commands ────────────────────────────────────────────

macro_rules! simple_command {
    ($(#[$doc:meta])* $name:ident => $method:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl Command for $name {
            fn method(&self) -> &str {
                $method
            }
        }
    };
}

simple_command!(
    /// Device clock.
    GetTime => "get_time"
);
simple_command!(
    /// Keep-alive used by the heartbeat task.
    TestConnection => "test_connection"
);
simple_command!(
    /// Full device state (power, storage, focuser, mount ...).
    GetDeviceState => "get_device_state"
);
simple_command!(
    /// Current view: stage, mode, target, stacking progress.
    GetViewState => "get_view_state"
);
simple_command!(
    /// Current equatorial coordinates.
    GetEquCoord => "scope_get_equ_coord"
);
simple_command!(
    /// Current focuser step.
    GetFocuserPosition => "get_focuser_position"
);
simple_command!(
    /// Start the frame stream on the imaging channel.
    BeginStreaming => "begin_streaming"
);
simple_command!(
    /// Stop the frame stream on the imaging channel.
    StopStreaming => "stop_streaming"
);
simple_command!(
    /// Ask the imaging channel for the current stacked image.
    GetStackedImage => "get_stacked_img"
);

// ── Parameterized commands ───────────────────────────────────────

/// Slew to J2000 coordinates (`ra` in degrees). Progress is reported by
/// `AutoGoto` stage events.
#[derive(Debug, Clone, PartialEq)]
pub struct GotoTarget {
    pub target_name: String,
    pub ra: f64,
    pub dec: f64,
}

impl Command for GotoTarget {
    fn method(&self) -> &str {
        "goto_target"
    }

    fn params(&self) -> Option<Value> {
        Some(json!({
            "target_name": self.target_name,
            "is_j2000": true,
            "ra": self.ra,
            "dec": self.dec,
        }))
    }
}

/// Exposure length of each stacked sub-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetExposure {
    pub millis: u64,
}

impl Command for SetExposure {
    fn method(&self) -> &str {
        "set_setting"
    }

    fn params(&self) -> Option<Value> {
        Some(json!({"exp_ms": {"stack_l": self.millis}}))
    }
}

/// Camera gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetGain(pub u32);

impl Command for SetGain {
    fn method(&self) -> &str {
        "set_control_value"
    }

    fn params(&self) -> Option<Value> {
        Some(json!(["gain", self.0]))
    }
}

/// Any command, given by name.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    pub method: String,
    pub params: Option<Value>,
}

impl RawCommand {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

impl Command for RawCommand {
    fn method(&self) -> &str {
        &self.method
    }

    fn params(&self) -> Option<Value> {
        self.params.clone()
    }
}
