use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::log::{event_payload, EventLogDocument, LogEntry};
use crate::Event;

/// Durable sink for the event log. Stores receive entries in chain order.
pub trait EventLogStore {
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Make everything appended so far durable under the given chain head.
    fn commit(&mut self, chain_head: [u8; 32]) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Json,
    Sqlite,
}

impl StoreKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "json" => Ok(StoreKind::Json),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(anyhow!("config: unknown event store '{}'", other)),
        }
    }
}

pub fn open_store(kind: StoreKind, path: &Path, kernel_version: &str) -> Result<Box<dyn EventLogStore>> {
    match kind {
        StoreKind::Json => Ok(Box::new(JsonFileEventLogStore::new(path, kernel_version))),
        StoreKind::Sqlite => Ok(Box::new(SqliteEventLogStore::open(path, kernel_version)?)),
    }
}

fn ensure_continuity(last_hash: [u8; 32], entries: &[LogEntry]) -> Result<[u8; 32]> {
    let mut expected = last_hash;
    for entry in entries {
        if entry.prev_hash != expected {
            return Err(anyhow!("log: entry chain does not continue the stored chain"));
        }
        expected = entry.entry_hash;
    }
    Ok(expected)
}

// -------------------- In-Memory --------------------

#[derive(Debug, Default)]
pub struct InMemoryEventLogStore {
    entries: Vec<LogEntry>,
    committed_head: Option<[u8; 32]>,
}

impl InMemoryEventLogStore {
    pub fn events(&self) -> Vec<Event> {
        self.entries.iter().map(|entry| entry.event.clone()).collect()
    }

    pub fn committed_head(&self) -> Option<[u8; 32]> {
        self.committed_head
    }
}

impl EventLogStore for InMemoryEventLogStore {
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        let last = self.entries.last().map(|e| e.entry_hash).unwrap_or([0u8; 32]);
        ensure_continuity(last, entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn commit(&mut self, chain_head: [u8; 32]) -> Result<()> {
        self.committed_head = Some(chain_head);
        Ok(())
    }
}

// -------------------- JSON Document --------------------

/// Writes the whole structured document on every commit (temp file + rename).
pub struct JsonFileEventLogStore {
    path: PathBuf,
    kernel_version: String,
    entries: Vec<LogEntry>,
}

impl JsonFileEventLogStore {
    pub fn new(path: &Path, kernel_version: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            kernel_version: kernel_version.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLogStore for JsonFileEventLogStore {
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        let last = self.entries.last().map(|e| e.entry_hash).unwrap_or([0u8; 32]);
        ensure_continuity(last, entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn commit(&mut self, chain_head: [u8; 32]) -> Result<()> {
        let events = self.entries.iter().map(|entry| entry.event.clone()).collect();
        let doc = EventLogDocument::new(&self.kernel_version, events)?;
        if doc.chain_head != hex::encode(chain_head) {
            return Err(anyhow!("log: committed chain head does not match stored events"));
        }
        let json = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| anyhow!("failed to write event log {}: {}", tmp.display(), e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| anyhow!("failed to move event log into {}: {}", self.path.display(), e))?;
        Ok(())
    }
}

pub fn read_document(path: &Path) -> Result<EventLogDocument> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read event log {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("invalid event log {}: {}", path.display(), e))
}

// -------------------- SQLite --------------------

/// One `runs` row per opened store; events chain from genesis within a run.
pub struct SqliteEventLogStore {
    conn: Connection,
    run_id: i64,
}

impl SqliteEventLogStore {
    pub fn open(path: &Path, kernel_version: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, kernel_version)
    }

    pub fn with_connection(conn: Connection, kernel_version: &str) -> Result<Self> {
        ensure_schema(&conn)?;
        conn.execute(
            "INSERT INTO runs(kernel_version, event_count, chain_head) VALUES (?1, 0, ?2)",
            params![kernel_version, vec![0u8; 32]],
        )?;
        let run_id = conn.last_insert_rowid();
        Ok(Self { conn, run_id })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn last_entry_hash(&self) -> Result<[u8; 32]> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT entry_hash FROM track_events WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                params![self.run_id],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => blob32(bytes, "track_events.entry_hash"),
            None => Ok([0u8; 32]),
        }
    }
}

pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS runs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          kernel_version TEXT NOT NULL,
          event_count INTEGER NOT NULL,
          chain_head BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS track_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id INTEGER NOT NULL REFERENCES runs(id),
          t_ms REAL NOT NULL,
          track_id INTEGER NOT NULL,
          state_id INTEGER NOT NULL,
          state_name TEXT NOT NULL,
          group_name TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          prev_hash BLOB NOT NULL,
          entry_hash BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_track_events_run ON track_events(run_id);
        "#,
    )?;
    Ok(())
}

impl EventLogStore for SqliteEventLogStore {
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        ensure_continuity(self.last_entry_hash()?, entries)?;
        let tx = self.conn.transaction()?;
        for entry in entries {
            let ev = &entry.event;
            let track_id = i64::try_from(ev.track_id)
                .map_err(|_| anyhow!("track id {} exceeds i64 range", ev.track_id))?;
            let payload = String::from_utf8(event_payload(ev)?)?;
            tx.execute(
                r#"
                INSERT INTO track_events(run_id, t_ms, track_id, state_id, state_name, group_name,
                                         payload_json, prev_hash, entry_hash)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    self.run_id,
                    ev.t_ms,
                    track_id,
                    i64::from(ev.state_id),
                    ev.state_name,
                    ev.group.as_str(),
                    payload,
                    entry.prev_hash.to_vec(),
                    entry.entry_hash.to_vec(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn commit(&mut self, chain_head: [u8; 32]) -> Result<()> {
        let stored = self.last_entry_hash()?;
        if stored != chain_head {
            return Err(anyhow!("log: committed chain head does not match stored events"));
        }
        self.conn.execute(
            r#"
            UPDATE runs
            SET chain_head = ?1,
                event_count = (SELECT COUNT(*) FROM track_events WHERE run_id = ?2)
            WHERE id = ?2
            "#,
            params![chain_head.to_vec(), self.run_id],
        )?;
        Ok(())
    }
}

pub(crate) fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt {}: expected 32 bytes, got {}",
            context,
            bytes.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
