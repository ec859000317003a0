//! Per-track debounced class promotion.
//!
//! Each track moves `UNSEEN -> PENDING(class, since) -> STABLE(class)` and may
//! fall back to `PENDING` for a different class at any time. A class change
//! discards the dwell time accumulated by the previous candidate.

use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct TrackState {
    pub track_id: u64,
    pub pending_class: u32,
    /// When `pending_class` was first observed in its current run.
    pub pending_since_ms: f64,
    pub stable_class: Option<u32>,
    pub last_seen_ms: f64,
}

/// A confirmed change of a track's stable class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Promotion {
    pub track_id: u64,
    pub class_id: u32,
    pub previous_class: Option<u32>,
    pub t_ms: f64,
}

pub struct TrackStabilizer {
    debounce_ms: f64,
    /// `None` keeps every track for the whole run.
    eviction_ms: Option<f64>,
    tracks: BTreeMap<u64, TrackState>,
}

impl TrackStabilizer {
    pub fn new(debounce_ms: u64, eviction_ms: Option<u64>) -> Self {
        Self {
            debounce_ms: debounce_ms as f64,
            eviction_ms: eviction_ms.map(|ms| ms as f64),
            tracks: BTreeMap::new(),
        }
    }

    /// Record one observation of `track_id` with filtered class `class_id`.
    pub fn observe(&mut self, track_id: u64, class_id: u32, t_ms: f64) -> Option<Promotion> {
        let Some(state) = self.tracks.get_mut(&track_id) else {
            log::debug!("track {}: pending class {} (new)", track_id, class_id);
            self.tracks.insert(
                track_id,
                TrackState {
                    track_id,
                    pending_class: class_id,
                    pending_since_ms: t_ms,
                    stable_class: None,
                    last_seen_ms: t_ms,
                },
            );
            return None;
        };

        state.last_seen_ms = t_ms;
        if state.pending_class != class_id {
            log::debug!(
                "track {}: pending class {} -> {}, timer reset",
                track_id,
                state.pending_class,
                class_id
            );
            state.pending_class = class_id;
            state.pending_since_ms = t_ms;
            return None;
        }

        if t_ms - state.pending_since_ms >= self.debounce_ms
            && state.stable_class != Some(class_id)
        {
            let previous_class = state.stable_class.replace(class_id);
            return Some(Promotion {
                track_id,
                class_id,
                previous_class,
                t_ms,
            });
        }
        None
    }

    /// Drop tracks unseen for longer than the eviction window.
    pub fn evict_stale(&mut self, now_ms: f64) -> usize {
        let Some(window) = self.eviction_ms else {
            return 0;
        };
        let before = self.tracks.len();
        self.tracks.retain(|id, state| {
            let keep = now_ms - state.last_seen_ms <= window;
            if !keep {
                log::debug!("track {}: evicted after {:.0} ms unseen", id, now_ms - state.last_seen_ms);
            }
            keep
        });
        before - self.tracks.len()
    }

    pub fn get(&self, track_id: u64) -> Option<&TrackState> {
        self.tracks.get(&track_id)
    }

    pub fn stable_class(&self, track_id: u64) -> Option<u32> {
        self.tracks.get(&track_id).and_then(|state| state.stable_class)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
