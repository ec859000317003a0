//! Append-only, hash-chained log of confirmed track state changes.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::detect::Group;
use crate::storage::EventLogStore;

pub const EVENT_LOG_FORMAT: &str = "signal-events/v1";

/// One confirmed stable-class transition of a track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub t_ms: f64,
    pub track_id: u64,
    pub state_id: u32,
    pub state_name: String,
    pub group: Group,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub event: Event,
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
}

/// Hashes a log entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Canonical payload bytes for chaining. Field order is fixed by the struct.
pub fn event_payload(event: &Event) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

/// Recompute the chain head over an ordered event sequence.
pub fn chain_head(events: &[Event]) -> Result<[u8; 32]> {
    let mut head = [0u8; 32];
    for event in events {
        head = hash_entry(&head, &event_payload(event)?);
    }
    Ok(head)
}

/// Structured document persisted at run end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLogDocument {
    pub format: String,
    pub kernel_version: String,
    pub event_count: usize,
    /// Hex SHA-256 chain head over `events`.
    pub chain_head: String,
    pub events: Vec<Event>,
}

impl EventLogDocument {
    pub fn new(kernel_version: &str, events: Vec<Event>) -> Result<Self> {
        let head = chain_head(&events)?;
        Ok(Self {
            format: EVENT_LOG_FORMAT.to_string(),
            kernel_version: kernel_version.to_string(),
            event_count: events.len(),
            chain_head: hex::encode(head),
            events,
        })
    }
}

/// In-memory buffer in front of an `EventLogStore`.
///
/// Entries are never mutated or removed; `flush` hands the unwritten tail to
/// the store and advances the watermark.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<LogEntry>,
    flushed: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: Event) -> Result<&LogEntry> {
        if let Some(last) = self.entries.last() {
            if event.t_ms < last.event.t_ms {
                return Err(anyhow!(
                    "log: event at {} ms precedes last entry at {} ms",
                    event.t_ms,
                    last.event.t_ms
                ));
            }
        }
        let prev_hash = self.head();
        let entry_hash = hash_entry(&prev_hash, &event_payload(&event)?);
        self.entries.push(LogEntry {
            event,
            prev_hash,
            entry_hash,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Chain head, or genesis `[0; 32]` when empty.
    pub fn head(&self) -> [u8; 32] {
        self.entries
            .last()
            .map(|entry| entry.entry_hash)
            .unwrap_or([0u8; 32])
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn events(&self) -> Vec<Event> {
        self.entries.iter().map(|entry| entry.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unflushed(&self) -> &[LogEntry] {
        &self.entries[self.flushed..]
    }

    /// Write buffered-but-unwritten entries. Returns how many were written.
    pub fn flush(&mut self, store: &mut dyn EventLogStore) -> Result<usize> {
        let pending = &self.entries[self.flushed..];
        if !pending.is_empty() {
            store.append_entries(pending)?;
        }
        store.commit(self.head())?;
        let written = pending.len();
        self.flushed = self.entries.len();
        Ok(written)
    }
}
