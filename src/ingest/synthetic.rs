//! Seeded synthetic signal scenarios behind `stub://<scenario>`.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{frame_time_ms, SourceStats};
use crate::detect::{BBox, Detection, DetectionFrame};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const CYCLES: u64 = 3;
const FLICKER_P: f64 = 0.04;
const DROPOUT_P: f64 = 0.02;

const RED: u32 = 2;
const GREEN: u32 = 0;
const YELLOW: u32 = 5;
const OFF: u32 = 8;
const RED_PED: u32 = 9;
const GREEN_PED: u32 = 10;
const UNMAPPED: u32 = 99;

/// Vehicle signal phases, in cycle order, with durations in ms.
const PHASES: [(u32, f64); 3] = [(RED, 4000.0), (GREEN, 4000.0), (YELLOW, 1500.0)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// One vehicle head cycling red, green, yellow.
    Cycle,
    /// Two vehicle heads, a pedestrian head, an unmapped sign and a speck too
    /// small to pass the area filter.
    Intersection,
    /// A dark signal head.
    Dark,
}

pub(super) struct SyntheticSource {
    name: String,
    scenario: Scenario,
    fps: u32,
    rng: StdRng,
    total_frames: u64,
    next_index: u64,
}

impl SyntheticSource {
    pub(super) fn new(scenario: &str, fps: u32, seed: u64) -> Result<Self> {
        let parsed = match scenario.trim_end_matches('/') {
            "" | "cycle" => Scenario::Cycle,
            "intersection" => Scenario::Intersection,
            "dark" => Scenario::Dark,
            other => return Err(anyhow!("ingest: unknown synthetic scenario '{}'", other)),
        };
        let fps = fps.max(1);
        let cycle_ms: f64 = PHASES.iter().map(|(_, ms)| ms).sum();
        let total_frames = (cycle_ms * CYCLES as f64 * f64::from(fps) / 1000.0).round() as u64;
        log::info!(
            "FileSource: synthetic scenario {:?} ({} frames @ {} fps, seed {})",
            parsed,
            total_frames,
            fps,
            seed
        );
        Ok(Self {
            name: format!("stub://{}", scenario),
            scenario: parsed,
            fps,
            rng: StdRng::seed_from_u64(seed),
            total_frames,
            next_index: 0,
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn next_frame(&mut self) -> Option<DetectionFrame> {
        if self.next_index >= self.total_frames {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        let t_ms = frame_time_ms(index, self.fps);
        let vehicle = phase_at(t_ms);

        let mut detections = Vec::new();
        match self.scenario {
            Scenario::Cycle => {
                self.push_head(&mut detections, 1, vehicle, (600.0, 80.0));
            }
            Scenario::Intersection => {
                self.push_head(&mut detections, 1, vehicle, (420.0, 90.0));
                self.push_head(&mut detections, 2, vehicle, (820.0, 95.0));
                let pedestrian = if vehicle == RED { GREEN_PED } else { RED_PED };
                self.push_head(&mut detections, 3, pedestrian, (1040.0, 300.0));
                let sign = self.jittered_box((200.0, 200.0), 60.0, 60.0);
                detections.push(Detection::new(sign, UNMAPPED, 0.9));
                let speck = self.jittered_box((100.0, 100.0), 6.0, 8.0);
                detections.push(Detection::new(speck, RED, 0.95).tracked(4));
            }
            Scenario::Dark => {
                self.push_head(&mut detections, 1, OFF, (600.0, 80.0));
            }
        }

        Some(DetectionFrame {
            index,
            t_ms: Some(t_ms),
            width: WIDTH,
            height: HEIGHT,
            detections,
        })
    }

    pub(super) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.next_index,
            frame_errors: 0,
            source: self.name.clone(),
        }
    }

    fn push_head(&mut self, out: &mut Vec<Detection>, track_id: u64, class_id: u32, at: (f32, f32)) {
        if self.rng.gen_bool(DROPOUT_P) {
            return;
        }
        let class_id = if self.rng.gen_bool(FLICKER_P) {
            confusable(class_id)
        } else {
            class_id
        };
        let bbox = self.jittered_box(at, 40.0, 100.0);
        let confidence: f32 = self.rng.gen_range(0.62..0.97);
        out.push(Detection::new(bbox, class_id, confidence).tracked(track_id));
    }

    fn jittered_box(&mut self, (x, y): (f32, f32), w: f32, h: f32) -> BBox {
        let dx: f32 = self.rng.gen_range(-1.5..1.5);
        let dy: f32 = self.rng.gen_range(-1.5..1.5);
        BBox::new(x + dx, y + dy, x + dx + w, y + dy + h)
    }
}

fn phase_at(t_ms: f64) -> u32 {
    let cycle_ms: f64 = PHASES.iter().map(|(_, ms)| ms).sum();
    let mut offset = t_ms % cycle_ms;
    for (class_id, duration) in PHASES {
        if offset < duration {
            return class_id;
        }
        offset -= duration;
    }
    RED
}

/// A plausible single-frame misread.
fn confusable(class_id: u32) -> u32 {
    match class_id {
        RED => YELLOW,
        YELLOW => RED,
        GREEN => 1,
        RED_PED => GREEN_PED,
        GREEN_PED => RED_PED,
        other => other,
    }
}
