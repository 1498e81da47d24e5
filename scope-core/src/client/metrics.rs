//! Per-frame timing for the imaging channel.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::state::ImagingStatus;

/// Rolling window of inter-frame latencies.
#[derive(Debug, Clone)]
pub struct FrameTiming {
    window: usize,
    samples: VecDeque<Duration>,
    last_frame: Option<Instant>,
    total_frames: u64,
    total_bytes: u64,
}

impl FrameTiming {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            last_frame: None,
            total_frames: 0,
            total_bytes: 0,
        }
    }

    /// Record a frame received at `now`. Returns the time since the
    /// previous frame, `None` for the first one.
    pub fn record(&mut self, now: Instant, size: usize) -> Option<Duration> {
        self.total_frames += 1;
        self.total_bytes += size as u64;
        let elapsed = self.last_frame.map(|prev| now.saturating_duration_since(prev));
        self.last_frame = Some(now);
        if let Some(elapsed) = elapsed {
            if self.samples.len() == self.window {
                self.samples.pop_front();
            }
            self.samples.push_back(elapsed);
        }
        elapsed
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        Some(sum / self.samples.len() as u32)
    }

    pub fn fps(&self) -> Option<f64> {
        let avg = self.average()?.as_secs_f64();
        (avg > 0.0).then(|| 1.0 / avg)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Forget everything, e.g. when a new session starts.
    pub fn reset(&mut self) {
        *self = Self::new(self.window);
    }

    /// Copy the current figures into `status`.
    pub fn publish(&self, elapsed: Option<Duration>, size: usize, status: &mut ImagingStatus) {
        if let Some(elapsed) = elapsed {
            status.last_image_elapsed_ms = Some(elapsed.as_millis() as u64);
        }
        status.avg_image_elapsed_ms = self.average().map(|d| d.as_secs_f64() * 1000.0);
        status.last_image_size_bytes = Some(size);
        status.total_frames = self.total_frames;
        status.total_bytes = self.total_bytes;
        status.fps = self.fps();
    }
}
