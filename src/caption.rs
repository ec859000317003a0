//! Frame state resolution and two-stage caption stabilization.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::{FrameState, Group};

/// One group member present in the current frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameMember {
    pub class_id: u32,
    pub group: Group,
    pub confidence: f32,
}

/// Highest-priority group with at least one member, else `NONE`.
pub fn resolve_frame_state(members: &[FrameMember]) -> FrameState {
    FrameState(members.iter().map(|member| member.group).min())
}

// -------------------- Phrase Table --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptionPhrase {
    pub group: Group,
    /// `None` is the group-wide fallback.
    pub class_id: Option<u32>,
    pub text: &'static str,
}

/// `OFF` has no phrase: a dark signal is not captioned.
pub const CAPTION_TABLE: [CaptionPhrase; 9] = [
    CaptionPhrase {
        group: Group::Red,
        class_id: Some(3),
        text: "Red light / Left turn stop",
    },
    CaptionPhrase {
        group: Group::Red,
        class_id: None,
        text: "Red light / Stop",
    },
    CaptionPhrase {
        group: Group::Green,
        class_id: Some(1),
        text: "Green light / Turn left",
    },
    CaptionPhrase {
        group: Group::Green,
        class_id: Some(4),
        text: "Green light / Directional arrow",
    },
    CaptionPhrase {
        group: Group::Green,
        class_id: None,
        text: "Green light / Go straight",
    },
    CaptionPhrase {
        group: Group::Yellow,
        class_id: Some(6),
        text: "Yellow light / Caution (left)",
    },
    CaptionPhrase {
        group: Group::Yellow,
        class_id: None,
        text: "Yellow light / Caution",
    },
    CaptionPhrase {
        group: Group::Warn,
        class_id: None,
        text: "Pedestrian warning",
    },
    CaptionPhrase {
        group: Group::Countdown,
        class_id: None,
        text: "Pedestrian countdown",
    },
];

/// Exact `(group, class)` phrase, else the group fallback. `OFF` has none.
pub fn caption_text(group: Group, class_id: u32) -> Option<&'static str> {
    let exact = CAPTION_TABLE
        .iter()
        .find(|phrase| phrase.group == group && phrase.class_id == Some(class_id));
    let fallback = || {
        CAPTION_TABLE
            .iter()
            .find(|phrase| phrase.group == group && phrase.class_id.is_none())
    };
    exact.or_else(fallback).map(|phrase| phrase.text)
}

// -------------------- Caption Decision --------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptionGate {
    pub min_tracks: usize,
    pub min_conf: f32,
}

impl Default for CaptionGate {
    fn default() -> Self {
        Self {
            min_tracks: 1,
            min_conf: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CaptionCandidate {
    pub text: Option<&'static str>,
    pub group: Option<Group>,
    pub dominant_class: Option<u32>,
    pub member_count: usize,
    pub best_confidence: f32,
}

impl CaptionCandidate {
    pub const EMPTY: CaptionCandidate = CaptionCandidate {
        text: None,
        group: None,
        dominant_class: None,
        member_count: 0,
        best_confidence: 0.0,
    };
}

/// Pick the dominant class of the frame-state group and gate the phrase on
/// member count and best confidence.
pub fn decide_caption(
    state: FrameState,
    members: &[FrameMember],
    gate: &CaptionGate,
) -> CaptionCandidate {
    let Some(group) = state.group() else {
        return CaptionCandidate::EMPTY;
    };

    let mut class_counts: BTreeMap<u32, usize> = BTreeMap::new();
    let mut member_count = 0usize;
    let mut best_confidence = 0.0f32;
    for member in members.iter().filter(|member| member.group == group) {
        *class_counts.entry(member.class_id).or_insert(0) += 1;
        member_count += 1;
        best_confidence = best_confidence.max(member.confidence);
    }

    // BTreeMap iterates ascending, so strict `>` keeps the lowest id on ties.
    let mut dominant: Option<(u32, usize)> = None;
    for (&class_id, &count) in &class_counts {
        if dominant.map_or(true, |(_, best)| count > best) {
            dominant = Some((class_id, count));
        }
    }
    let dominant_class = dominant.map(|(class_id, _)| class_id);

    let gated = member_count >= gate.min_tracks && best_confidence >= gate.min_conf;
    let text = match (gated, dominant_class) {
        (true, Some(class_id)) => caption_text(group, class_id),
        _ => None,
    };

    CaptionCandidate {
        text,
        group: Some(group),
        dominant_class,
        member_count,
        best_confidence,
    }
}

// -------------------- Caption Stabilizer --------------------

/// The displayed caption. The only caption state that outlives a frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StableCaption {
    pub text: Option<&'static str>,
    /// Unset until the first change, so the first eligible caption shows at once.
    pub last_change_ms: Option<f64>,
}

pub struct CaptionStabilizer {
    min_frames: u32,
    debounce_ms: f64,
    previous_text: Option<&'static str>,
    consecutive_count: u32,
    stable: StableCaption,
}

impl CaptionStabilizer {
    pub fn new(min_frames: u32, debounce_ms: u64) -> Self {
        Self {
            min_frames,
            debounce_ms: debounce_ms as f64,
            previous_text: None,
            consecutive_count: 0,
            stable: StableCaption::default(),
        }
    }

    /// Feed this frame's candidate text. Returns true when the displayed text changed.
    pub fn update(&mut self, text: Option<&'static str>, now_ms: f64) -> bool {
        if text.is_some() && text == self.previous_text {
            self.consecutive_count = self.consecutive_count.saturating_add(1);
        } else {
            self.consecutive_count = u32::from(text.is_some());
        }
        self.previous_text = text;

        let Some(eligible) = text.filter(|_| self.consecutive_count >= self.min_frames) else {
            return false;
        };
        if self.stable.text == Some(eligible) {
            return false;
        }
        let debounced = self
            .stable
            .last_change_ms
            .map_or(true, |last| now_ms - last >= self.debounce_ms);
        if !debounced {
            return false;
        }
        self.stable.text = Some(eligible);
        self.stable.last_change_ms = Some(now_ms);
        true
    }

    pub fn stable(&self) -> &StableCaption {
        &self.stable
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(class_id: u32, group: Group, confidence: f32) -> FrameMember {
        FrameMember {
            class_id,
            group,
            confidence,
        }
    }

    #[test]
    fn red_beats_green_regardless_of_order() {
        let members = [member(0, Group::Green, 0.99), member(2, Group::Red, 0.6)];
        assert_eq!(resolve_frame_state(&members), FrameState(Some(Group::Red)));
        let reversed = [members[1], members[0]];
        assert_eq!(resolve_frame_state(&reversed), FrameState(Some(Group::Red)));
        assert_eq!(resolve_frame_state(&[]), FrameState::NONE);
    }

    #[test]
    fn phrase_table_specific_then_fallback() {
        assert_eq!(caption_text(Group::Red, 3), Some("Red light / Left turn stop"));
        assert_eq!(caption_text(Group::Red, 12), Some("Red light / Stop"));
        assert_eq!(caption_text(Group::Green, 1), Some("Green light / Turn left"));
        assert_eq!(caption_text(Group::Green, 4), Some("Green light / Directional arrow"));
        assert_eq!(caption_text(Group::Green, 10), Some("Green light / Go straight"));
        assert_eq!(caption_text(Group::Yellow, 6), Some("Yellow light / Caution (left)"));
        assert_eq!(caption_text(Group::Yellow, 5), Some("Yellow light / Caution"));
        assert_eq!(caption_text(Group::Warn, 13), Some("Pedestrian warning"));
        assert_eq!(caption_text(Group::Countdown, 7), Some("Pedestrian countdown"));
        assert_eq!(caption_text(Group::Off, 8), None);
    }

    #[test]
    fn every_group_but_off_has_a_fallback() {
        for group in crate::detect::GROUP_PRIORITY {
            let has_fallback = CAPTION_TABLE
                .iter()
                .any(|phrase| phrase.group == group && phrase.class_id.is_none());
            assert_eq!(has_fallback, group != Group::Off, "{}", group);
        }
    }

    #[test]
    fn dominant_class_ties_break_to_lowest_id() {
        let members = [
            member(3, Group::Red, 0.9),
            member(2, Group::Red, 0.7),
            member(0, Group::Green, 0.9),
        ];
        let cand = decide_caption(FrameState(Some(Group::Red)), &members, &CaptionGate::default());
        assert_eq!(cand.dominant_class, Some(2));
        assert_eq!(cand.member_count, 2);
        assert_eq!(cand.best_confidence, 0.9);
        assert_eq!(cand.text, Some("Red light / Stop"));
    }

    #[test]
    fn most_frequent_class_wins() {
        let members = [
            member(2, Group::Red, 0.9),
            member(3, Group::Red, 0.7),
            member(3, Group::Red, 0.7),
        ];
        let cand = decide_caption(FrameState(Some(Group::Red)), &members, &CaptionGate::default());
        assert_eq!(cand.dominant_class, Some(3));
        assert_eq!(cand.text, Some("Red light / Left turn stop"));
    }

    #[test]
    fn gate_blocks_thin_or_weak_groups() {
        let members = [member(2, Group::Red, 0.9)];
        let strict_count = CaptionGate {
            min_tracks: 2,
            min_conf: 0.5,
        };
        let cand = decide_caption(FrameState(Some(Group::Red)), &members, &strict_count);
        assert_eq!(cand.text, None);

        let strict_conf = CaptionGate {
            min_tracks: 1,
            min_conf: 0.95,
        };
        let cand = decide_caption(FrameState(Some(Group::Red)), &members, &strict_conf);
        assert_eq!(cand.text, None);

        let exact = CaptionGate {
            min_tracks: 1,
            min_conf: 0.9,
        };
        let cand = decide_caption(FrameState(Some(Group::Red)), &members, &exact);
        assert_eq!(cand.text, Some("Red light / Stop"));
    }

    #[test]
    fn none_state_yields_empty_candidate() {
        let cand = decide_caption(FrameState::NONE, &[], &CaptionGate::default());
        assert_eq!(cand, CaptionCandidate::EMPTY);
    }

    #[test]
    fn five_frames_never_displays_with_min_six() {
        let mut stab = CaptionStabilizer::new(6, 800);
        for frame in 0..5 {
            assert!(!stab.update(Some("Red light / Stop"), frame as f64 * 33.0));
        }
        stab.update(None, 200.0);
        assert_eq!(stab.stable().text, None);
        assert_eq!(stab.consecutive_count(), 0);
    }

    #[test]
    fn sixth_frame_becomes_eligible_and_displays_first_caption() {
        let mut stab = CaptionStabilizer::new(6, 800);
        for frame in 0..5 {
            stab.update(Some("Red light / Stop"), frame as f64 * 33.0);
        }
        assert!(stab.update(Some("Red light / Stop"), 165.0));
        assert_eq!(stab.stable().text, Some("Red light / Stop"));
        assert_eq!(stab.stable().last_change_ms, Some(165.0));
    }

    #[test]
    fn eligible_swap_waits_for_debounce() {
        let mut stab = CaptionStabilizer::new(2, 800);
        stab.update(Some("Red light / Stop"), 0.0);
        assert!(stab.update(Some("Red light / Stop"), 100.0));

        stab.update(Some("Green light / Go straight"), 200.0);
        assert!(!stab.update(Some("Green light / Go straight"), 300.0), "eligible but debounced");
        assert!(!stab.update(Some("Green light / Go straight"), 899.0));
        assert_eq!(stab.stable().text, Some("Red light / Stop"));
        assert!(stab.update(Some("Green light / Go straight"), 900.0));
        assert_eq!(stab.stable().text, Some("Green light / Go straight"));
    }

    #[test]
    fn single_frame_flicker_does_not_reach_display() {
        let mut stab = CaptionStabilizer::new(3, 0);
        for t in 0..3 {
            stab.update(Some("Red light / Stop"), t as f64);
        }
        stab.update(Some("Green light / Go straight"), 3.0);
        stab.update(Some("Red light / Stop"), 4.0);
        assert_eq!(stab.stable().text, Some("Red light / Stop"));
        assert_eq!(stab.consecutive_count(), 1);
    }

    #[test]
    fn null_candidate_never_clears_display() {
        let mut stab = CaptionStabilizer::new(1, 0);
        assert!(stab.update(Some("Pedestrian warning"), 0.0));
        for t in 1..50 {
            assert!(!stab.update(None, t as f64 * 100.0));
        }
        assert_eq!(stab.stable().text, Some("Pedestrian warning"));
    }
}
