//! A named, ordered list of steps that can be saved and loaded as JSON.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::{Step, timestamp};
use crate::error::ScopeError;

/// Run state of a whole sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SequenceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Completed, failed or cancelled.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "commands")]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub state: SequenceState,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Top-level step the run is at; steps before it are done.
    #[serde(default)]
    pub current_command_index: usize,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            state: SequenceState::Idle,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_command_index: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        self.steps.iter().try_for_each(Step::validate)
    }

    /// Step at `path`, one index per nesting level.
    pub fn step_at(&self, path: &[usize]) -> Option<&Step> {
        let (first, rest) = path.split_first()?;
        let mut step = self.steps.get(*first)?;
        for index in rest {
            step = step.children().get(*index)?;
        }
        Some(step)
    }

    pub(crate) fn step_at_mut(&mut self, path: &[usize]) -> Option<&mut Step> {
        let (first, rest) = path.split_first()?;
        let mut step = self.steps.get_mut(*first)?;
        for index in rest {
            step = step.children_mut()?.get_mut(*index)?;
        }
        Some(step)
    }

    /// Forget all progress so the sequence runs from the top again.
    pub fn reset(&mut self) {
        self.steps.iter_mut().for_each(Step::reset);
        self.state = SequenceState::Idle;
        self.started_at = None;
        self.completed_at = None;
        self.current_command_index = 0;
    }

    // ── JSON ─────────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<String, ScopeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate.
    pub fn from_json(text: &str) -> Result<Self, ScopeError> {
        let sequence: Self =
            serde_json::from_str(text).map_err(|e| ScopeError::InvalidSequence(e.to_string()))?;
        sequence.validate()?;
        Ok(sequence)
    }

    pub fn save(&self, path: &Path) -> Result<(), ScopeError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ScopeError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

// ── Tests ────────────────────────────────────────────────────────
