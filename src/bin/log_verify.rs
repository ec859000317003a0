//! log_verify - External verifier for signal event log integrity
//!
//! This tool proves:
//! - The event log is hash-chained from genesis (tamper-evident)
//! - The recorded chain head and event count match the recomputed chain
//! - Events are in non-decreasing time order
//!
//! Works on both persisted forms: the JSON document and the SQLite store.

use anyhow::Result;
use clap::Parser;
use rusqlite::{Connection, OpenFlags};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use signal_kernel::storage::{read_document, StoreKind};
use signal_kernel::verify;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "log_verify",
    about = "Verify signal event log integrity (hash chain + recorded head)"
)]
struct Args {
    /// Path to the event log (JSON document or SQLite DB)
    #[arg(long, default_value = "signal_events.json")]
    log: PathBuf,

    /// Store kind (json|sqlite). Guessed from the extension when omitted.
    #[arg(long, value_name = "KIND")]
    store: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let ui = ui::Ui::from_args(
        &args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );
    let kind = match args.store.as_deref() {
        Some(raw) => StoreKind::parse(raw)?,
        None => guess_kind(&args.log),
    };

    println!("log_verify: checking {}", args.log.display());
    println!();

    match kind {
        StoreKind::Json => {
            let doc = {
                let _stage = ui.stage("Read event document");
                read_document(&args.log)?
            };
            let _stage = ui.stage("Verify event chain");
            println!("=== Event Document ===");
            println!("format: {}, kernel_version: {}", doc.format, doc.kernel_version);
            if args.verbose {
                for event in &doc.events {
                    println!(
                        "  t_ms={} track={} -> {} ({})",
                        event.t_ms, event.track_id, event.state_name, event.group
                    );
                }
            }
            let report = verify::verify_document(&doc)?;
            println!(
                "verified {} events, chain_head={}",
                report.event_count,
                hex::encode(report.chain_head)
            );
        }
        StoreKind::Sqlite => {
            let conn = {
                let _stage = ui.stage("Open database");
                Connection::open_with_flags(&args.log, OpenFlags::SQLITE_OPEN_READ_ONLY)?
            };
            let _stage = ui.stage("Verify runs");
            println!("=== Runs ===");
            let reports = verify::verify_sqlite_with(&conn, |id, entry_hash| {
                if args.verbose {
                    println!("  event {}: hash={} OK", id, &hex::encode(entry_hash)[..16]);
                }
            })?;
            for report in &reports {
                println!(
                    "run {}: verified {} events, chain_head={}",
                    report.run_id.unwrap_or_default(),
                    report.event_count,
                    hex::encode(report.chain_head)
                );
            }
            println!("verified {} runs", reports.len());
        }
    }

    println!("OK: event chain verified.");
    Ok(())
}

fn guess_kind(path: &Path) -> StoreKind {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("db" | "sqlite" | "sqlite3") => StoreKind::Sqlite,
        _ => StoreKind::Json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_store_from_extension() {
        assert_eq!(guess_kind(Path::new("events.db")), StoreKind::Sqlite);
        assert_eq!(guess_kind(Path::new("run/events.sqlite3")), StoreKind::Sqlite);
        assert_eq!(guess_kind(Path::new("events.json")), StoreKind::Json);
        assert_eq!(guess_kind(Path::new("events")), StoreKind::Json);
    }
}
