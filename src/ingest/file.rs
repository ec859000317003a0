//! Local file detection source.
//!
//! `FileSource` replays detector/tracker output recorded as JSON lines, one
//! frame per line:
//!
//! ```text
//! {"t_ms": 33.3, "width": 1280, "height": 720,
//!  "detections": [{"bbox": {"x1": 600, "y1": 100, "x2": 640, "y2": 200},
//!                  "class_id": 2, "confidence": 0.91, "track_id": 1}]}
//! ```
//!
//! Frames are numbered by line in file order; blank lines are ignored. The
//! file source MUST NOT fetch remote URLs.

use anyhow::{anyhow, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};

use super::synthetic::SyntheticSource;
use super::{DetectionSource, SourceStats};
use crate::detect::DetectionFrame;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local path to a `.jsonl` replay, or `stub://<scenario>`.
    pub path: String,
    /// Frame rate used to stamp synthetic frames.
    pub fps: u32,
    /// Seed for synthetic scenarios.
    pub seed: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            fps: 30,
            seed: 0,
        }
    }
}

/// Local file detection source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    Jsonl(JsonlSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "ingest: file source only supports local paths (no URL schemes)"
            ));
        }
        let backend = match config.path.strip_prefix("stub://") {
            Some(scenario) => {
                FileBackend::Synthetic(SyntheticSource::new(scenario, config.fps, config.seed)?)
            }
            None => FileBackend::Jsonl(JsonlSource::open(&config.path)?),
        };
        Ok(Self { backend })
    }
}

impl DetectionSource for FileSource {
    fn name(&self) -> &str {
        match &self.backend {
            FileBackend::Synthetic(source) => source.name(),
            FileBackend::Jsonl(source) => &source.path,
        }
    }

    fn next_frame(&mut self) -> Result<Option<DetectionFrame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => Ok(source.next_frame()),
            FileBackend::Jsonl(source) => source.next_frame(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
            FileBackend::Jsonl(source) => SourceStats {
                frames_read: source.frames_read,
                frame_errors: source.frame_errors,
                source: source.path.clone(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// JSON-lines replay
// ----------------------------------------------------------------------------

struct JsonlSource {
    path: String,
    lines: Lines<BufReader<File>>,
    line_no: u64,
    next_index: u64,
    frames_read: u64,
    frame_errors: u64,
}

impl JsonlSource {
    fn open(path: &str) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| anyhow!("ingest: failed to open replay {}: {}", path, e))?;
        log::info!("FileSource: replaying {}", path);
        Ok(Self {
            path: path.to_string(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
            next_index: 0,
            frames_read: 0,
            frame_errors: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<DetectionFrame>> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            self.line_no += 1;
            let line = line.map_err(|e| {
                self.frame_errors += 1;
                anyhow!("ingest: {} line {}: {}", self.path, self.line_no, e)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let index = self.next_index;
            self.next_index += 1;
            return match serde_json::from_str::<DetectionFrame>(&line) {
                Ok(mut frame) => {
                    frame.index = index;
                    self.frames_read += 1;
                    Ok(Some(frame))
                }
                Err(e) => {
                    self.frame_errors += 1;
                    Err(anyhow!(
                        "ingest: {} line {}: undecodable frame: {}",
                        self.path,
                        self.line_no,
                        e
                    ))
                }
            };
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
