//! Detection frame sources.
//!
//! The engine consumes detector/tracker output, never pixels. Sources here
//! produce `DetectionFrame` values in capture order:
//! - JSON-lines replay of a recorded detector run (local paths only)
//! - `stub://<scenario>` seeded synthetic signal cycles (demo and tests)
//!
//! Sources do not stabilize or filter anything. A line that cannot be decoded
//! is surfaced as an error for that frame; the host decides via
//! `FrameErrorPolicy` whether the run continues.

use anyhow::{anyhow, Result};
use std::time::Instant;

use crate::detect::DetectionFrame;

pub mod file;
mod synthetic;

pub use file::{FileConfig, FileSource};

/// Pull-based source of detection frames.
pub trait DetectionSource {
    fn name(&self) -> &str;

    /// `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<DetectionFrame>>;

    fn stats(&self) -> SourceStats;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_read: u64,
    pub frame_errors: u64,
    pub source: String,
}

/// What the host does with a frame the source could not decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameErrorPolicy {
    /// Log, count and continue. Timers are not reset.
    #[default]
    Skip,
    /// Stop the run, flush the event log, exit non-zero.
    Abort,
}

impl FrameErrorPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "skip" => Ok(FrameErrorPolicy::Skip),
            "abort" => Ok(FrameErrorPolicy::Abort),
            other => Err(anyhow!("config: unknown frame_errors policy '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClockMode {
    /// Timestamps recorded with each frame, else `index * 1000 / fps`.
    #[default]
    Recorded,
    /// Wall time elapsed since the first frame was stamped.
    Monotonic,
}

impl ClockMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "recorded" => Ok(ClockMode::Recorded),
            "monotonic" => Ok(ClockMode::Monotonic),
            other => Err(anyhow!("config: unknown clock '{}'", other)),
        }
    }
}

/// Assigns the millisecond timestamp the engine sees for each frame.
#[derive(Debug)]
pub struct FrameClock {
    mode: ClockMode,
    fps: u32,
    started: Option<Instant>,
}

impl FrameClock {
    pub fn new(mode: ClockMode, fps: u32) -> Self {
        Self {
            mode,
            fps: fps.max(1),
            started: None,
        }
    }

    pub fn timestamp(&mut self, frame: &DetectionFrame) -> f64 {
        match self.mode {
            ClockMode::Recorded => frame
                .t_ms
                .unwrap_or_else(|| frame_time_ms(frame.index, self.fps)),
            ClockMode::Monotonic => {
                let started = *self.started.get_or_insert_with(Instant::now);
                started.elapsed().as_secs_f64() * 1000.0
            }
        }
    }
}

pub(crate) fn frame_time_ms(index: u64, fps: u32) -> f64 {
    index as f64 * 1000.0 / f64::from(fps.max(1))
}
