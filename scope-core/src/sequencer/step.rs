//! Sequence steps: what each one does and where it is in its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScopeError;

// ── Status ───────────────────────────────────────────────────────

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl StepStatus {
    /// Running or paused mid-way.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

// ── Astronomical events ──────────────────────────────────────────

/// Sun-altitude events a step can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstronomicalEvent {
    AstronomicalDawn,
    NauticalDawn,
    CivilDawn,
    Sunrise,
    Sunset,
    CivilDusk,
    NauticalDusk,
    AstronomicalDusk,
}

/// Observer location in degrees and metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: f64,
}

// ── Actions ──────────────────────────────────────────────────────

/// What a step does. Serialized with a `command_type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type")]
pub enum StepAction {
    #[serde(rename = "WaitMinutesCommand")]
    WaitMinutes { minutes: f64 },

    #[serde(rename = "WaitUntilTimeCommand")]
    WaitUntilTime {
        #[serde(with = "timestamp")]
        target_time: DateTime<Utc>,
    },

    #[serde(rename = "WaitUntilEventCommand")]
    WaitUntilEvent {
        event: AstronomicalEvent,
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        elevation: f64,
    },

    /// Slew to J2000 `ra`/`dec`, both in degrees.
    #[serde(rename = "GoToTargetCommand")]
    GoToTarget {
        ra: f64,
        dec: f64,
        #[serde(default)]
        target_name: Option<String>,
    },

    /// Start the frame stream. With `count`, the step lasts until that many
    /// frames have arrived and then stops the stream again.
    #[serde(rename = "StartImagingCommand")]
    StartImaging {
        exposure_time: f64,
        #[serde(default = "default_gain")]
        gain: u32,
        #[serde(default)]
        count: Option<u64>,
    },

    #[serde(rename = "StopImagingCommand")]
    StopImaging,

    /// Child steps run in order.
    #[serde(rename = "SequenceCommand")]
    Sequence {
        #[serde(default)]
        commands: Vec<Step>,
        #[serde(default = "default_true")]
        stop_on_error: bool,
    },
}

pub const MAX_GAIN: u32 = 200;

fn default_gain() -> u32 {
    80
}

fn default_true() -> bool {
    true
}

// ── Step ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            description: None,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
            action,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn wait_minutes(name: impl Into<String>, minutes: f64) -> Self {
        Self::new(name, StepAction::WaitMinutes { minutes })
    }

    pub fn wait_until(name: impl Into<String>, target_time: DateTime<Utc>) -> Self {
        Self::new(name, StepAction::WaitUntilTime { target_time })
    }

    pub fn wait_for_event(name: impl Into<String>, event: AstronomicalEvent, site: Site) -> Self {
        Self::new(
            name,
            StepAction::WaitUntilEvent {
                event,
                latitude: site.latitude,
                longitude: site.longitude,
                elevation: site.elevation,
            },
        )
    }

    pub fn goto(name: impl Into<String>, ra: f64, dec: f64, target_name: Option<String>) -> Self {
        Self::new(name, StepAction::GoToTarget { ra, dec, target_name })
    }

    pub fn start_imaging(name: impl Into<String>, exposure_time: f64, gain: u32) -> Self {
        Self::new(
            name,
            StepAction::StartImaging {
                exposure_time,
                gain,
                count: None,
            },
        )
    }

    pub fn stop_imaging(name: impl Into<String>) -> Self {
        Self::new(name, StepAction::StopImaging)
    }

    pub fn group(name: impl Into<String>, commands: Vec<Step>, stop_on_error: bool) -> Self {
        Self::new(
            name,
            StepAction::Sequence {
                commands,
                stop_on_error,
            },
        )
    }

    /// Child steps, for a nested sequence.
    pub fn children(&self) -> &[Step] {
        match &self.action {
            StepAction::Sequence { commands, .. } => commands,
            _ => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<Step>> {
        match &mut self.action {
            StepAction::Sequence { commands, .. } => Some(commands),
            _ => None,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub(crate) fn mark_started(&mut self) {
        self.status = StepStatus::Running;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Move this step and its children from `from` to `to`.
    pub(crate) fn transition(&mut self, from: StepStatus, to: StepStatus) {
        if self.status == from {
            self.status = to;
            if to == StepStatus::Cancelled {
                self.completed_at = Some(Utc::now());
            }
        }
        if let Some(children) = self.children_mut() {
            for child in children {
                child.transition(from, to);
            }
        }
    }

    /// Back to a never-run step, children included.
    pub(crate) fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        if let Some(children) = self.children_mut() {
            children.iter_mut().for_each(Step::reset);
        }
    }

    // ── Validation ───────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ScopeError> {
        let invalid = |what: &str| ScopeError::InvalidSequence(format!("step '{}': {what}", self.name));
        match &self.action {
            StepAction::WaitMinutes { minutes } => {
                if !minutes.is_finite() || *minutes <= 0.0 {
                    return Err(invalid("minutes must be positive"));
                }
            }
            StepAction::WaitUntilEvent {
                latitude, longitude, ..
            } => {
                if !(-90.0..=90.0).contains(latitude) || !(-180.0..=180.0).contains(longitude) {
                    return Err(invalid("site outside latitude/longitude range"));
                }
            }
            StepAction::GoToTarget { dec, .. } => {
                if !(-90.0..=90.0).contains(dec) {
                    return Err(invalid("dec must be within ±90°"));
                }
            }
            StepAction::StartImaging {
                exposure_time,
                gain,
                count,
            } => {
                if !exposure_time.is_finite() || *exposure_time <= 0.0 {
                    return Err(invalid("exposure_time must be positive"));
                }
                if *gain > MAX_GAIN {
                    return Err(invalid("gain must be within 0..=200"));
                }
                if *count == Some(0) {
                    return Err(invalid("count must be at least 1"));
                }
            }
            StepAction::Sequence { commands, .. } => {
                commands.iter().try_for_each(Step::validate)?;
            }
            StepAction::WaitUntilTime { .. } | StepAction::StopImaging => {}
        }
        Ok(())
    }
}

// ── Timestamps ───────────────────────────────────────────────────

/// RFC 3339 out; RFC 3339 or zone-less ISO 8601 (taken as UTC) in.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| text.parse::<NaiveDateTime>().ok().map(|t| t.and_utc()))
    }

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {text:?}")))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            time: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(time) => serializer.serialize_some(&time.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(text) => parse(&text)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {text:?}"))),
                None => Ok(None),
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
