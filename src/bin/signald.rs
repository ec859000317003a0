//! signald - traffic-signal stabilization daemon
//!
//! This daemon:
//! 1. Reads detection frames from the configured source (JSONL replay or stub://)
//! 2. Stamps each frame (recorded or monotonic clock)
//! 3. Runs the engine: filter, grouping, track debounce, frame state, captions
//! 4. Logs state and caption changes, optionally prints per-frame status lines
//! 5. Flushes the hash-chained event log at end of stream or on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;

use signal_kernel::config::SignalConfig;
use signal_kernel::ingest::{FileConfig, FileSource};
use signal_kernel::storage::open_store;
use signal_kernel::{
    DetectionSource, Engine, FrameClock, FrameErrorPolicy, FrameOutcome, RunOptions, StoreKind,
    KERNEL_VERSION,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "signald",
    version,
    about = "Stabilize traffic-signal detections into states, captions and events"
)]
struct Args {
    /// Config file (JSON, or TOML by extension). Defaults to $SIGNAL_CONFIG.
    #[arg(long, value_name = "PATH", env = "SIGNAL_CONFIG")]
    config: Option<PathBuf>,

    /// Detection source: a local .jsonl replay or stub://<scenario>.
    #[arg(long, value_name = "SOURCE")]
    source: Option<String>,

    /// Event log output path.
    #[arg(long, value_name = "PATH")]
    events: Option<PathBuf>,

    /// Event store (json|sqlite).
    #[arg(long, value_name = "KIND")]
    store: Option<String>,

    /// Undecodable frame policy (skip|abort).
    #[arg(long, value_name = "POLICY")]
    frame_errors: Option<String>,

    /// Seed for stub:// scenarios.
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Flush the event log every N frames (0 = only at the end).
    #[arg(long, default_value_t = 0)]
    flush_every: u64,

    /// Print one JSON status line per frame to stdout.
    #[arg(long)]
    status: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(
        &args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal() && !args.status,
    );

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = SignalConfig::load_from(args.config.as_deref())?;
        if let Some(source) = &args.source {
            cfg.source.path = source.clone();
        }
        if let Some(path) = &args.events {
            cfg.events.path = path.clone();
        }
        if let Some(store) = &args.store {
            cfg.events.store = StoreKind::parse(store)?;
        }
        if let Some(policy) = &args.frame_errors {
            cfg.frame_errors = FrameErrorPolicy::parse(policy)?;
        }
        if let Some(seed) = args.seed {
            cfg.source.seed = seed;
        }
        cfg
    };

    let mut source = {
        let _stage = ui.stage("Open detection source");
        FileSource::new(FileConfig {
            path: cfg.source.path.clone(),
            fps: cfg.source.fps,
            seed: cfg.source.seed,
        })?
    };
    let mut store = {
        let _stage = ui.stage("Open event store");
        open_store(cfg.events.store, &cfg.events.path, KERNEL_VERSION)?
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "signald {} running. source={} events={} ({:?})",
        KERNEL_VERSION,
        source.name(),
        cfg.events.path.display(),
        cfg.events.store
    );
    log::info!(
        "debounce: track={}ms caption={}ms/{} frames, frame_errors={:?}",
        cfg.engine.track_debounce_ms,
        cfg.engine.caption_debounce_ms,
        cfg.engine.caption_min_frames,
        cfg.frame_errors
    );

    let mut clock = FrameClock::new(cfg.source.clock, cfg.source.fps);
    let mut engine = Engine::new(cfg.engine.clone(), cfg.classes.clone());
    let options = RunOptions {
        frame_errors: cfg.frame_errors,
        max_frames: args.max_frames,
        flush_every: args.flush_every,
    };

    let progress = ui.frames(args.max_frames);
    let result = engine.run(
        &mut source,
        &mut clock,
        store.as_mut(),
        &options,
        || rx.try_recv().is_ok(),
        |outcome| {
            progress.tick(outcome.frame_state.as_str());
            if args.status {
                print_status(outcome)?;
            }
            Ok(())
        },
    );
    progress.finish();

    let stats = source.stats();
    log::info!(
        "source {}: frames_read={} frame_errors={}",
        stats.source,
        stats.frames_read,
        stats.frame_errors
    );
    result.map(|_| ())
}

fn print_status(outcome: &FrameOutcome) -> Result<()> {
    let line = serde_json::json!({
        "frame": outcome.frame_index,
        "t_ms": outcome.t_ms,
        "frame_state": outcome.frame_state,
        "caption": outcome.caption,
        "caption_changed": outcome.caption_changed,
        "events": outcome.events,
        "stats": outcome.stats,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
