//! Best-known device attributes, one snapshot per client.
//!
//! Snapshots are plain values. The owning client keeps the live copy
//! behind a `watch` channel and hands out clones. Every `apply_*` method
//! touches only the fields present in its input, so concurrent sources
//! never erase each other's data (last write wins per field).

use serde::Serialize;
use serde_json::Value;

use crate::message::{EventBody, PiStatus, ScopeEvent, StackProgress, StageUpdate, ViewUpdate};
use crate::state::ClientMode;

macro_rules! set_if_some {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = Some(v);
        }
    };
}

// ── ScopeStatus (text channel) ───────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScopeStatus {
    // power
    pub temp: Option<f64>,
    pub charger_status: Option<String>,
    pub charge_online: Option<bool>,
    pub battery_capacity: Option<u32>,
    pub is_overtemp: Option<bool>,

    // mount and optics
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub focus_position: Option<i64>,

    // stacking
    pub stacked_frame: Option<u64>,
    pub dropped_frame: Option<u64>,
    pub target_name: Option<String>,

    // view
    pub stage: Option<String>,
    pub view_mode: Option<String>,
    pub view_state: Option<String>,
    pub client_mode: Option<ClientMode>,

    /// Last stage event seen (`AutoGoto`, `AutoFocus` ...) and its state.
    pub operation: Option<String>,
    pub operation_state: Option<String>,

    // storage
    pub free_mb: Option<u64>,
    pub total_mb: Option<u64>,

    pub last_timestamp: Option<String>,
}

impl ScopeStatus {
    pub fn apply_pi_status(&mut self, pi: &PiStatus) {
        set_if_some!(self.temp, pi.temp);
        set_if_some!(self.charger_status, pi.charger_status.clone());
        set_if_some!(self.charge_online, pi.charge_online);
        set_if_some!(self.battery_capacity, pi.battery_capacity);
        set_if_some!(self.is_overtemp, pi.is_overtemp);
    }

    pub fn apply_coordinates(&mut self, ra: f64, dec: f64) {
        self.ra = Some(ra);
        self.dec = Some(dec);
    }

    pub fn apply_focus(&mut self, step: i64) {
        self.focus_position = Some(step);
    }

    pub fn apply_stack(&mut self, stack: &StackProgress) {
        set_if_some!(self.stacked_frame, stack.stacked_frame);
        set_if_some!(self.dropped_frame, stack.dropped_frame);
        set_if_some!(self.target_name, stack.target_name.clone());
    }

    /// Returns the mode implied by the view, if it implies one.
    pub fn apply_view(&mut self, view: &ViewUpdate) -> Option<ClientMode> {
        set_if_some!(self.stage, view.stage.clone());
        set_if_some!(self.view_mode, view.mode.clone());
        set_if_some!(self.view_state, view.state.clone());
        set_if_some!(self.target_name, view.target_name.clone());
        ClientMode::from_view(view.stage.as_deref(), view.state.as_deref())
    }

    pub fn apply_stage(&mut self, kind: &str, stage: &StageUpdate) {
        self.operation = Some(kind.to_string());
        self.operation_state = stage.state.clone();
    }

    pub fn apply_storage(&mut self, free_mb: Option<u64>, total_mb: Option<u64>) {
        set_if_some!(self.free_mb, free_mb);
        set_if_some!(self.total_mb, total_mb);
    }

    /// Pick status-shaped fields out of a command result.
    ///
    /// Results are matched by shape rather than by method, since several
    /// commands return overlapping structures. Returns the mode implied by
    /// an embedded view, if any.
    pub fn apply_result(&mut self, method: Option<&str>, result: &Value) -> Option<ClientMode> {
        let Value::Object(map) = result else {
            if let (Some("get_focuser_position" | "scope_get_focuser_position"), Some(step)) =
                (method, result.as_i64())
            {
                self.apply_focus(step);
            }
            return None;
        };

        if let Some(pi) = map.get("pi_status").and_then(decode::<PiStatus>) {
            self.apply_pi_status(&pi);
        } else if map.contains_key("battery_capacity") || map.contains_key("temp") {
            if let Some(pi) = decode::<PiStatus>(result) {
                self.apply_pi_status(&pi);
            }
        }

        if let Some(step) = map
            .get("focuser")
            .and_then(|f| f.get("step"))
            .and_then(Value::as_i64)
        {
            self.apply_focus(step);
        }

        if let (Some(ra), Some(dec)) = (
            map.get("ra").and_then(Value::as_f64),
            map.get("dec").and_then(Value::as_f64),
        ) {
            self.apply_coordinates(ra, dec);
        }

        let volume = map
            .get("storage")
            .and_then(|s| s.get("storage_volume"))
            .and_then(|v| v.get(0));
        let storage = volume.unwrap_or(result);
        self.apply_storage(
            storage.get("freeMB").and_then(Value::as_u64),
            storage.get("totalMB").and_then(Value::as_u64),
        );

        let view = map.get("View")?;
        if let Some(stack) = view.get("Stack").and_then(decode::<StackProgress>) {
            self.apply_stack(&stack);
        }
        decode::<ViewUpdate>(view).and_then(|v| self.apply_view(&v))
    }

    /// Fold a recognised event into the snapshot. Returns the mode implied
    /// by a `View` event, if any.
    pub fn apply_event(&mut self, event: &ScopeEvent) -> Option<ClientMode> {
        set_if_some!(self.last_timestamp, event.timestamp.clone());
        match &event.body {
            EventBody::PiStatus(pi) => self.apply_pi_status(pi),
            EventBody::Stack(stack) => self.apply_stack(stack),
            EventBody::View(view) => return self.apply_view(view),
            EventBody::Stage(stage) => self.apply_stage(&event.kind, stage),
            EventBody::ModeChanged(change) => self.client_mode = Some(change.new_mode.clone()),
            EventBody::Unknown(_) => {}
        }
        None
    }
}

// ── ImagingStatus (binary channel) ───────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImagingStatus {
    pub temp: Option<f64>,
    pub battery_capacity: Option<u32>,
    pub stacked_frame: u64,
    pub dropped_frame: u64,
    /// `frame_complete` events that arrived while a fetch was in flight.
    pub skipped_frame: u64,
    pub target_name: Option<String>,

    pub is_streaming: bool,
    pub is_fetching_images: bool,
    pub is_receiving_image: bool,

    pub last_image_elapsed_ms: Option<u64>,
    pub avg_image_elapsed_ms: Option<f64>,
    pub last_image_size_bytes: Option<usize>,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub fps: Option<f64>,
}

impl ImagingStatus {
    /// Clear everything except the fetch preference.
    pub fn reset(&mut self) {
        let fetching = self.is_fetching_images;
        *self = Self {
            is_fetching_images: fetching,
            ..Self::default()
        };
    }

    pub fn apply_event(&mut self, event: &ScopeEvent) {
        match &event.body {
            EventBody::PiStatus(pi) => {
                set_if_some!(self.temp, pi.temp);
                set_if_some!(self.battery_capacity, pi.battery_capacity);
            }
            EventBody::Stack(stack) => {
                if let Some(n) = stack.stacked_frame {
                    self.stacked_frame = n;
                }
                if let Some(n) = stack.dropped_frame {
                    self.dropped_frame = n;
                }
                set_if_some!(self.target_name, stack.target_name.clone());
            }
            _ => {}
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

// ── Tests ────────────────────────────────────────────────────────
