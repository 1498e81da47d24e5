//! Observation sequences: ordered steps (waits, slews, imaging, nested
//! groups) run against the clients, with pause, resume, stop and JSON
//! persistence.

mod runner;
mod sequence;
mod step;

pub use runner::{EventClock, SequenceContext, SequenceRunner};
pub use sequence::{Sequence, SequenceState};
pub use step::{AstronomicalEvent, MAX_GAIN, Site, Step, StepAction, StepStatus};
