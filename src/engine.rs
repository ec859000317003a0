//! Per-run decision engine.
//!
//! One `Engine` owns every piece of mutable state for one video source: the
//! ROI (fixed at the first frame), the track table, the caption stabilizer and
//! the event log. Frames are processed synchronously and in order.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::caption::{
    decide_caption, resolve_frame_state, CaptionCandidate, CaptionGate, CaptionStabilizer,
    FrameMember, StableCaption,
};
use crate::detect::{ClassTable, Detection, DetectionFrame, FrameState};
use crate::filter::{DetectionFilter, FilterThresholds, FilterVerdict, Roi};
use crate::ingest::{DetectionSource, FrameClock, FrameErrorPolicy};
use crate::log::{Event, EventLog};
use crate::storage::EventLogStore;
use crate::track::{Promotion, TrackStabilizer};
use crate::IngestGuard;

/// Where the frame state's members come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameStateSource {
    /// Tracked detections count through their track's stable class; untracked
    /// detections count with their raw class.
    #[default]
    Auto,
    /// Every filtered detection counts with its raw class.
    Detections,
}

impl FrameStateSource {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "auto" | "tracks" => Ok(FrameStateSource::Auto),
            "detections" => Ok(FrameStateSource::Detections),
            other => Err(anyhow!("config: unknown frame_state_source '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Raw normalized ROI (`"nx,ny,nw,nh"` or 8 values). Malformed falls back to full frame.
    pub roi: Option<String>,
    pub filter: FilterThresholds,
    pub track_debounce_ms: u64,
    /// `None` keeps unseen tracks for the whole run.
    pub track_eviction_ms: Option<u64>,
    pub frame_state_source: FrameStateSource,
    pub captions_enabled: bool,
    pub caption_gate: CaptionGate,
    pub caption_min_frames: u32,
    pub caption_debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            roi: None,
            filter: FilterThresholds::default(),
            track_debounce_ms: 800,
            track_eviction_ms: Some(10_000),
            frame_state_source: FrameStateSource::Auto,
            captions_enabled: true,
            caption_gate: CaptionGate::default(),
            caption_min_frames: 6,
            caption_debounce_ms: 800,
        }
    }
}

/// How `Engine::run` drives a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub frame_errors: FrameErrorPolicy,
    /// Stop after this many frames, processed or skipped.
    pub max_frames: Option<u64>,
    /// Flush the event log every N processed frames (0 = only at the end).
    pub flush_every: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub received: usize,
    pub rejected: usize,
    /// Passing detections whose track id already appeared earlier in the frame.
    pub duplicates: usize,
    pub filtered_out: usize,
    pub ungrouped: usize,
    pub evicted_tracks: usize,
}

/// Everything the display/logging collaborators need for one frame.
#[derive(Clone, Debug, Serialize)]
pub struct FrameOutcome {
    pub frame_index: u64,
    pub t_ms: f64,
    pub frame_state: FrameState,
    pub state_changed: bool,
    pub caption: Option<&'static str>,
    pub caption_changed: bool,
    pub candidate: CaptionCandidate,
    /// Detections that passed validation and filtering, grouped or not.
    pub kept: Vec<Detection>,
    pub events: Vec<Event>,
    pub stats: FrameStats,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub frames_processed: u64,
    /// Frames dropped under `FrameErrorPolicy::Skip`.
    pub frames_skipped: u64,
    pub events_logged: usize,
    pub events_flushed: usize,
    pub live_tracks: usize,
    /// Detections that failed validation.
    pub rejected_detections: u64,
    /// Repeated track ids dropped after filtering.
    pub duplicate_detections: u64,
    pub chain_head: String,
    pub final_caption: Option<&'static str>,
}

pub struct Engine {
    config: EngineConfig,
    classes: ClassTable,
    filter: Option<DetectionFilter>,
    frame_size: Option<(u32, u32)>,
    tracks: TrackStabilizer,
    captions: CaptionStabilizer,
    log: EventLog,
    frames_processed: u64,
    frames_skipped: u64,
    rejected_total: u64,
    duplicates_total: u64,
    last_t_ms: Option<f64>,
    last_state: FrameState,
}

impl Engine {
    pub fn new(config: EngineConfig, classes: ClassTable) -> Self {
        let tracks = TrackStabilizer::new(config.track_debounce_ms, config.track_eviction_ms);
        let captions = CaptionStabilizer::new(config.caption_min_frames, config.caption_debounce_ms);
        Self {
            config,
            classes,
            filter: None,
            frame_size: None,
            tracks,
            captions,
            log: EventLog::new(),
            frames_processed: 0,
            frames_skipped: 0,
            rejected_total: 0,
            duplicates_total: 0,
            last_t_ms: None,
            last_state: FrameState::NONE,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// `None` until the first frame fixes the ROI.
    pub fn roi(&self) -> Option<&Roi> {
        self.filter.as_ref().map(DetectionFilter::roi)
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size
    }

    pub fn tracks(&self) -> &TrackStabilizer {
        &self.tracks
    }

    pub fn stable_caption(&self) -> &StableCaption {
        self.captions.stable()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Process one frame's detections observed at `t_ms`.
    ///
    /// Invalid detections are dropped individually; the frame itself only
    /// fails when its timestamp is unusable.
    pub fn process_frame(&mut self, frame: &DetectionFrame, t_ms: f64) -> Result<FrameOutcome> {
        if !t_ms.is_finite() {
            return Err(anyhow!("ingest: frame {} has a non-finite timestamp", frame.index));
        }
        if let Some(last) = self.last_t_ms {
            if t_ms < last {
                return Err(anyhow!(
                    "ingest: frame {} at {} ms precedes previous frame at {} ms",
                    frame.index,
                    t_ms,
                    last
                ));
            }
        }
        if self.filter.is_none() {
            self.init_filter(frame.width, frame.height);
        }
        let Some(filter) = self.filter.as_ref() else {
            return Err(anyhow!("ingest: frame {} has no filter", frame.index));
        };

        let admitted = IngestGuard::admit(&frame.detections);
        let mut stats = FrameStats {
            received: frame.detections.len(),
            rejected: admitted.rejected,
            ..FrameStats::default()
        };

        let mut seen_tracks = BTreeSet::new();
        let mut kept = Vec::with_capacity(admitted.detections.len());
        let mut members = Vec::new();
        let mut events = Vec::new();
        for det in admitted.detections {
            let verdict = filter.verdict(det);
            if verdict != FilterVerdict::Pass {
                log::trace!("frame {}: class {} dropped ({:?})", frame.index, det.class_id, verdict);
                stats.filtered_out += 1;
                continue;
            }
            if let Some(track_id) = det.track_id {
                if !seen_tracks.insert(track_id) {
                    log::debug!("frame {}: dropping duplicate track id {}", frame.index, track_id);
                    stats.duplicates += 1;
                    continue;
                }
            }
            kept.push(det.clone());

            let Some(group) = self.classes.group_of(det.class_id) else {
                stats.ungrouped += 1;
                continue;
            };

            let member_class = match det.track_id {
                Some(track_id) => {
                    if let Some(promotion) = self.tracks.observe(track_id, det.class_id, t_ms) {
                        let event = promotion_event(&self.classes, promotion)?;
                        self.log.append(event.clone())?;
                        events.push(event);
                    }
                    match self.config.frame_state_source {
                        FrameStateSource::Auto => self.tracks.stable_class(track_id),
                        FrameStateSource::Detections => Some(det.class_id),
                    }
                }
                None => Some(det.class_id),
            };
            let member = member_class.and_then(|class_id| {
                let group = if class_id == det.class_id {
                    Some(group)
                } else {
                    self.classes.group_of(class_id)
                };
                group.map(|group| FrameMember {
                    class_id,
                    group,
                    confidence: det.confidence,
                })
            });
            members.extend(member);
        }
        stats.evicted_tracks = self.tracks.evict_stale(t_ms);

        let frame_state = resolve_frame_state(&members);
        let candidate = if self.config.captions_enabled {
            decide_caption(frame_state, &members, &self.config.caption_gate)
        } else {
            CaptionCandidate::EMPTY
        };
        let caption_changed = self.captions.update(candidate.text, t_ms);
        let caption = self.captions.stable().text;

        let state_changed = frame_state != self.last_state;
        if state_changed {
            log::info!(
                "frame {} @{:.0}ms: state {} -> {}",
                frame.index,
                t_ms,
                self.last_state,
                frame_state
            );
        }
        if caption_changed {
            log::info!(
                "frame {} @{:.0}ms: caption \"{}\"",
                frame.index,
                t_ms,
                caption.unwrap_or("")
            );
        }
        self.rejected_total += stats.rejected as u64;
        self.duplicates_total += stats.duplicates as u64;

        self.last_state = frame_state;
        self.last_t_ms = Some(t_ms);
        self.frames_processed += 1;

        Ok(FrameOutcome {
            frame_index: frame.index,
            t_ms,
            frame_state,
            state_changed,
            caption,
            caption_changed,
            candidate,
            kept,
            events,
            stats,
        })
    }

    /// Hand buffered events to the store without ending the run.
    pub fn flush(&mut self, store: &mut dyn EventLogStore) -> Result<usize> {
        self.log.flush(store)
    }

    /// Flush the remaining events and summarize the run.
    pub fn finish(&mut self, store: &mut dyn EventLogStore) -> Result<RunSummary> {
        let events_flushed = self.log.flush(store)?;
        Ok(RunSummary {
            frames_processed: self.frames_processed,
            frames_skipped: self.frames_skipped,
            events_logged: self.log.len(),
            events_flushed,
            live_tracks: self.tracks.len(),
            rejected_detections: self.rejected_total,
            duplicate_detections: self.duplicates_total,
            chain_head: hex::encode(self.log.head()),
            final_caption: self.captions.stable().text,
        })
    }

    /// Pull frames from `source` until it ends, `should_stop` returns true or
    /// `max_frames` is reached, then flush the event log.
    ///
    /// A frame the source cannot decode, or whose timestamp the engine
    /// rejects, is skipped or aborts the run per `frame_errors`. Skipped
    /// frames leave track and caption timers untouched. An aborted run still
    /// flushes everything logged so far before the error is returned.
    pub fn run(
        &mut self,
        source: &mut dyn DetectionSource,
        clock: &mut FrameClock,
        store: &mut dyn EventLogStore,
        options: &RunOptions,
        mut should_stop: impl FnMut() -> bool,
        mut on_frame: impl FnMut(&FrameOutcome) -> Result<()>,
    ) -> Result<RunSummary> {
        let mut flushed_at = self.frames_processed;
        let mut aborted: Option<anyhow::Error> = None;
        loop {
            if should_stop() {
                log::info!("stop requested, flushing event log");
                break;
            }
            if options
                .max_frames
                .is_some_and(|max| self.frames_processed + self.frames_skipped >= max)
            {
                break;
            }

            let step = source.next_frame().and_then(|frame| match frame {
                Some(frame) => {
                    let t_ms = clock.timestamp(&frame);
                    self.process_frame(&frame, t_ms).map(Some)
                }
                None => Ok(None),
            });
            match step {
                Ok(Some(outcome)) => {
                    if let Err(e) = on_frame(&outcome) {
                        aborted = Some(e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => match options.frame_errors {
                    FrameErrorPolicy::Skip => {
                        self.frames_skipped += 1;
                        log::warn!("skipping frame: {}", e);
                    }
                    FrameErrorPolicy::Abort => {
                        log::error!("aborting run: {}", e);
                        aborted = Some(e);
                        break;
                    }
                },
            }

            if options.flush_every > 0 && self.frames_processed - flushed_at >= options.flush_every {
                self.flush(store)?;
                flushed_at = self.frames_processed;
            }
        }

        let summary = self.finish(store)?;
        log::info!(
            "run over {}: frames={} skipped={} events={} rejected={} duplicates={} chain_head={}",
            source.name(),
            summary.frames_processed,
            summary.frames_skipped,
            summary.events_logged,
            summary.rejected_detections,
            summary.duplicate_detections,
            summary.chain_head
        );
        match aborted {
            Some(e) => Err(e.context(format!(
                "run aborted after {} frames ({} events flushed)",
                summary.frames_processed, summary.events_logged
            ))),
            None => Ok(summary),
        }
    }

    fn init_filter(&mut self, width: u32, height: u32) {
        let roi = Roi::from_raw_or_full(self.config.roi.as_deref(), width, height);
        log::info!("frame size {}x{}, roi {:?}", width, height, roi);
        self.frame_size = Some((width, height));
        self.filter = Some(DetectionFilter::new(self.config.filter.clone(), roi));
    }
}

fn promotion_event(classes: &ClassTable, promotion: Promotion) -> Result<Event> {
    let group = classes.group_of(promotion.class_id).ok_or_else(|| {
        anyhow!(
            "track {}: promoted class {} has no group",
            promotion.track_id,
            promotion.class_id
        )
    })?;
    let event = Event {
        t_ms: promotion.t_ms,
        track_id: promotion.track_id,
        state_id: promotion.class_id,
        state_name: classes.name_of(promotion.class_id),
        group,
    };
    log::info!(
        "track {} stable: {} ({}) at {:.0}ms",
        event.track_id,
        event.state_name,
        event.group,
        event.t_ms
    );
    Ok(event)
}
