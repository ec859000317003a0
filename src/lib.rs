//! Signal Kernel
//!
//! Temporal stabilization and decision engine for traffic-signal detections.
//! Per-frame detector output goes in. Stable signal states, debounced
//! captions and a hash-chained log of confirmed track changes come out.
//!
//! # Data flow
//!
//! 1. `IngestGuard` rejects malformed detections.
//! 2. `filter`: minimum area, ROI (bbox center), per-class confidence floors.
//!    The first passing detection per track id wins.
//! 3. `detect::ClassTable` maps class ids to semantic groups.
//! 4. `track`: per-track debounce, one `Event` per confirmed change.
//! 5. `caption`: frame state by group priority, caption candidate, two-stage
//!    caption stabilizer.
//! 6. `log` / `storage`: append-only event chain, flushed to JSON or SQLite.
//!
//! # Module Structure
//!
//! - `engine`: owns all per-run state and drives the steps above
//! - `ingest`: frame sources (JSONL replay, seeded synthetic scenarios)
//! - `config`: file + environment configuration for `signald`
//! - `verify`: offline chain verification

pub mod caption;
pub mod config;
pub mod detect;
pub mod engine;
pub mod filter;
pub mod ingest;
pub mod log;
pub mod storage;
pub mod track;
pub mod verify;

pub use caption::{CaptionGate, CaptionStabilizer, StableCaption};
pub use detect::{BBox, ClassEntry, ClassTable, Detection, DetectionFrame, FrameState, Group};
pub use engine::{Engine, EngineConfig, FrameOutcome, FrameStateSource, RunOptions, RunSummary};
pub use filter::{DetectionFilter, FilterThresholds, Roi, RoiSpec};
pub use ingest::{ClockMode, DetectionSource, FileSource, FrameClock, FrameErrorPolicy};
pub use log::{hash_entry, Event, EventLog, EventLogDocument};
pub use storage::{
    EventLogStore, InMemoryEventLogStore, JsonFileEventLogStore, SqliteEventLogStore, StoreKind,
};
pub use track::TrackStabilizer;

pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

// -------------------- Ingest Guard --------------------

/// Detections of one frame that survived validation.
#[derive(Debug, Default)]
pub struct Admitted<'a> {
    pub detections: Vec<&'a Detection>,
    /// Malformed bbox or confidence outside [0, 1].
    pub rejected: usize,
}

/// Entry gate for detector output. Nothing downstream sees a detection that
/// failed here, and a bad detection never fails the whole frame.
///
/// Duplicate track ids are not resolved here: the engine keeps the first
/// detection per track id among those that also pass the filter, so a
/// filtered-out first occurrence does not hide a valid later one.
pub struct IngestGuard;

impl IngestGuard {
    pub fn admit(detections: &[Detection]) -> Admitted<'_> {
        let mut admitted = Admitted {
            detections: Vec::with_capacity(detections.len()),
            ..Admitted::default()
        };
        for det in detections {
            if let Err(e) = det.validate() {
                ::log::warn!("dropping detection: {}", e);
                admitted.rejected += 1;
                continue;
            }
            admitted.detections.push(det);
        }
        admitted
    }
}
