//! Inbound message shapes and their classification.
//!
//! The device mixes replies and unsolicited pushes on the same channel
//! with nothing but field presence to tell them apart. Everything that
//! arrives goes through [`InboundMessage::classify`] exactly once; the
//! rest of the crate only ever sees the typed variants.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ScopeError;
use crate::state::ClientMode;

/// Event kind emitted by the text client whenever the tracked mode changes.
pub const CLIENT_MODE_CHANGED: &str = "ClientModeChanged";

/// Event kind used for unmatched responses that carry no method name.
pub const UNMATCHED_RESPONSE: &str = "Response";

/// Named events whose payload is a stage transition
/// (`state` plus optional failure fields).
const STAGE_EVENTS: &[&str] = &[
    "AutoGoto",
    "AutoFocus",
    "FocuserMove",
    "ScopeGoto",
    "ScopeHome",
    "ScopeMoveToHorizon",
    "ScopePark",
    "3PPA",
    "Initialise",
    "DarkLibrary",
    "PlateSolve",
    "ContinuousExposure",
    "Exposure",
    "AviRecord",
    "RTSP",
    "WheelMove",
];

// ── CommandResponse ──────────────────────────────────────────────

/// A reply on the text channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CommandResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "Timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Method echoed back by the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl CommandResponse {
    fn from_map(map: &Map<String, Value>) -> Self {
        let present = |key: &str| map.get(key).filter(|v| !v.is_null()).cloned();
        Self {
            id: map.get("id").and_then(Value::as_u64),
            timestamp: map
                .get("Timestamp")
                .and_then(Value::as_str)
                .map(str::to_owned),
            method: map.get("method").and_then(Value::as_str).map(str::to_owned),
            result: present("result"),
            error: present("error"),
            code: map.get("code").and_then(Value::as_i64),
        }
    }

    /// The device signals failure with an `error` field or a non-zero `code`.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.code.is_some_and(|c| c != 0)
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => self.code.filter(|c| *c != 0).map(|c| format!("code {c}")),
        }
    }

    /// The `result` payload, or [`ScopeError::Rejected`] for an error reply.
    pub fn into_result(self) -> Result<Value, ScopeError> {
        if self.is_error() {
            return Err(ScopeError::Rejected {
                method: self.method.clone().unwrap_or_default(),
                code: self.code,
                message: self.error_message().unwrap_or_default(),
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ── Event payloads ───────────────────────────────────────────────

/// Power and thermal push (`PiStatus`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PiStatus {
    pub temp: Option<f64>,
    pub charger_status: Option<String>,
    pub charge_online: Option<bool>,
    pub battery_capacity: Option<u32>,
    pub is_overtemp: Option<bool>,
}

/// Stacking progress (`Stack`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StackProgress {
    pub state: Option<String>,
    pub stacked_frame: Option<u64>,
    pub dropped_frame: Option<u64>,
    pub total_frame: Option<u64>,
    pub target_name: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub error: Option<String>,
}

/// View pipeline transition (`View`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewUpdate {
    pub state: Option<String>,
    pub stage: Option<String>,
    pub mode: Option<String>,
    pub target_name: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub error: Option<String>,
}

/// Generic stage transition (goto, autofocus, focuser move ...).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StageUpdate {
    pub state: Option<String>,
    pub percent: Option<f64>,
    #[serde(deserialize_with = "lenient_text")]
    pub error: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub reason: Option<String>,
}

/// Mode transition published on the bus by the text client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeChange {
    pub existing: Option<ClientMode>,
    pub new_mode: ClientMode,
}

// ── ScopeEvent ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    PiStatus(PiStatus),
    Stack(StackProgress),
    View(ViewUpdate),
    Stage(StageUpdate),
    ModeChanged(ModeChange),
    /// Anything we do not model, kept verbatim.
    Unknown(Value),
}

/// An unsolicited message, keyed on the bus by `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeEvent {
    pub kind: String,
    pub timestamp: Option<String>,
    pub body: EventBody,
}

impl ScopeEvent {
    /// Decode an event of the given kind from its raw fields.
    /// Payloads that do not fit the expected shape fall back to `Unknown`.
    pub fn from_fields(kind: impl Into<String>, value: Value) -> Self {
        let kind = kind.into();
        let timestamp = value
            .get("Timestamp")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let body = match kind.as_str() {
            "PiStatus" => decode(&value).map(EventBody::PiStatus),
            "Stack" => decode(&value).map(EventBody::Stack),
            "View" => decode(&value).map(EventBody::View),
            k if STAGE_EVENTS.contains(&k) => decode(&value).map(EventBody::Stage),
            _ => None,
        }
        .unwrap_or(EventBody::Unknown(value));

        Self {
            kind,
            timestamp,
            body,
        }
    }

    pub fn mode_changed(existing: Option<ClientMode>, new_mode: ClientMode) -> Self {
        Self {
            kind: CLIENT_MODE_CHANGED.to_string(),
            timestamp: None,
            body: EventBody::ModeChanged(ModeChange { existing, new_mode }),
        }
    }

    /// Re-publish a response nobody was waiting for.
    pub fn from_response(response: &CommandResponse) -> Self {
        let kind = response
            .method
            .clone()
            .unwrap_or_else(|| UNMATCHED_RESPONSE.to_string());
        Self {
            kind,
            timestamp: response.timestamp.clone(),
            body: EventBody::Unknown(serde_json::to_value(response).unwrap_or(Value::Null)),
        }
    }

    /// Stage state name (`working`, `complete`, `fail` ...), if any.
    pub fn state(&self) -> Option<&str> {
        match &self.body {
            EventBody::Stack(s) => s.state.as_deref(),
            EventBody::View(v) => v.state.as_deref(),
            EventBody::Stage(s) => s.state.as_deref(),
            EventBody::Unknown(raw) => raw.get("state").and_then(Value::as_str),
            EventBody::PiStatus(_) | EventBody::ModeChanged(_) => None,
        }
    }

    /// First populated of `error`, `message`, `reason`.
    pub fn failure_reason(&self) -> Option<String> {
        match &self.body {
            EventBody::Stage(s) => s
                .error
                .clone()
                .or_else(|| s.message.clone())
                .or_else(|| s.reason.clone()),
            EventBody::View(v) => v.error.clone(),
            EventBody::Stack(s) => s.error.clone(),
            EventBody::Unknown(raw) => ["error", "message", "reason"]
                .iter()
                .find_map(|key| raw.get(*key).and_then(text_of)),
            EventBody::PiStatus(_) | EventBody::ModeChanged(_) => None,
        }
    }
}

// ── Classification ───────────────────────────────────────────────

/// One parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(CommandResponse),
    Event(ScopeEvent),
    Unknown(Value),
}

impl InboundMessage {
    pub fn parse(line: &str) -> Result<Self, ScopeError> {
        Ok(Self::classify(serde_json::from_str(line)?))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ScopeError> {
        Ok(Self::classify(serde_json::from_slice(bytes)?))
    }

    /// `"Event"` field → named event; an ID or reply field → response;
    /// a bare `method` → event named after it; anything else is unknown.
    pub fn classify(value: Value) -> Self {
        let Value::Object(map) = &value else {
            return Self::Unknown(value);
        };

        if let Some(kind) = map.get("Event").and_then(Value::as_str) {
            let kind = kind.to_string();
            return Self::Event(ScopeEvent::from_fields(kind, value));
        }

        let has_id = map.get("id").and_then(Value::as_u64).is_some();
        let has_reply = ["result", "error", "code"]
            .iter()
            .any(|key| map.contains_key(*key));
        if has_id || has_reply {
            return Self::Response(CommandResponse::from_map(map));
        }

        if let Some(method) = map.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return Self::Event(ScopeEvent::from_fields(method, value));
        }

        Self::Unknown(value)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Accept strings, numbers or bools for free-text fields; the firmware
/// is not consistent about which it sends.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(text_of(&value))
}

// ── Tests ────────────────────────────────────────────────────────
