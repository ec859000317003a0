//! demo - end-to-end synthetic run for the signal kernel

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rusqlite::Connection;
use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;

use signal_kernel::ingest::{FileConfig, FileSource};
use signal_kernel::storage::{open_store, read_document};
use signal_kernel::verify;
use signal_kernel::{
    ClassTable, ClockMode, DetectionSource, Engine, EngineConfig, FrameClock, RunOptions, StoreKind,
    KERNEL_VERSION,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Synthetic scenario (cycle|intersection|dark).
    #[arg(long, default_value = "intersection")]
    scenario: String,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Deterministic seed for the scenario.
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Output directory for the event log.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// Event store (json|sqlite).
    #[arg(long, default_value = "json")]
    store: String,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    let ui = ui::Ui::from_args(
        &args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let kind = StoreKind::parse(&args.store)?;
    let log_path = out_dir.join(match kind {
        StoreKind::Json => "events.json",
        StoreKind::Sqlite => "events.db",
    });
    if log_path.exists() {
        fs::remove_file(&log_path)
            .with_context(|| format!("failed to replace {}", log_path.display()))?;
    }

    let mut source = FileSource::new(FileConfig {
        path: format!("stub://{}", args.scenario),
        fps: args.fps,
        seed: args.seed,
    })?;
    let mut store = open_store(kind, &log_path, KERNEL_VERSION)?;
    let mut engine = Engine::new(EngineConfig::default(), ClassTable::default());
    let mut clock = FrameClock::new(ClockMode::Recorded, args.fps);

    let mut timeline = Vec::new();
    let summary = {
        let _stage = ui.stage("Run synthetic scenario");
        engine.run(
            &mut source,
            &mut clock,
            store.as_mut(),
            &RunOptions::default(),
            || false,
            |outcome| {
                if outcome.caption_changed {
                    timeline.push((outcome.t_ms, outcome.caption.unwrap_or("")));
                }
                Ok(())
            },
        )?
    };
    drop(store);

    let verified = {
        let _stage = ui.stage("Verify event log");
        match kind {
            StoreKind::Json => verify::verify_document(&read_document(&log_path)?)?.event_count,
            StoreKind::Sqlite => {
                let conn = Connection::open(&log_path)?;
                verify::verify_sqlite_with(&conn, |_, _| {})?
                    .iter()
                    .map(|report| report.event_count)
                    .sum()
            }
        }
    };

    println!("demo: {} (seed {})", source.name(), args.seed);
    println!(
        "frames={} events={} rejected_detections={} duplicate_detections={}",
        summary.frames_processed,
        summary.events_logged,
        summary.rejected_detections,
        summary.duplicate_detections
    );
    println!();
    println!("=== Caption timeline ===");
    for (t_ms, caption) in &timeline {
        println!("  {:>8.0} ms  {}", t_ms, caption);
    }
    println!();
    println!("=== Track events ===");
    for event in engine.event_log().events() {
        println!(
            "  {:>8.0} ms  track {} -> {} ({})",
            event.t_ms, event.track_id, event.state_name, event.group
        );
    }
    println!();
    println!(
        "event log: {} ({} events verified, chain_head={})",
        log_path.display(),
        verified,
        summary.chain_head
    );
    Ok(())
}
