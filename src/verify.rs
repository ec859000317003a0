use anyhow::{anyhow, Result};
use rusqlite::Connection;

use crate::log::{chain_head, event_payload, hash_entry, EventLogDocument, EVENT_LOG_FORMAT};
use crate::storage::blob32;
use crate::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub run_id: Option<i64>,
    pub event_count: usize,
    pub chain_head: [u8; 32],
}

/// Recompute the chain over a JSON document and compare the recorded head.
pub fn verify_document(doc: &EventLogDocument) -> Result<VerifyReport> {
    if doc.format != EVENT_LOG_FORMAT {
        return Err(anyhow!("unsupported event log format '{}'", doc.format));
    }
    if doc.event_count != doc.events.len() {
        return Err(anyhow!(
            "event_count {} does not match {} recorded events",
            doc.event_count,
            doc.events.len()
        ));
    }
    for pair in doc.events.windows(2) {
        if pair[1].t_ms < pair[0].t_ms {
            return Err(anyhow!(
                "events out of time order at t_ms={}",
                pair[1].t_ms
            ));
        }
    }
    let head = chain_head(&doc.events)?;
    if hex::encode(head) != doc.chain_head.to_lowercase() {
        return Err(anyhow!(
            "chain head mismatch: recorded {}, computed {}",
            doc.chain_head,
            hex::encode(head)
        ));
    }
    Ok(VerifyReport {
        run_id: None,
        event_count: doc.events.len(),
        chain_head: head,
    })
}

/// Verify every run in an SQLite event store, calling `on_entry` per verified row.
pub fn verify_sqlite_with(
    conn: &Connection,
    mut on_entry: impl FnMut(i64, [u8; 32]),
) -> Result<Vec<VerifyReport>> {
    let mut runs = conn.prepare("SELECT id, event_count, chain_head FROM runs ORDER BY id ASC")?;
    let run_rows = runs
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut reports = Vec::with_capacity(run_rows.len());
    for (run_id, recorded_count, recorded_head) in run_rows {
        let recorded_head = blob32(recorded_head, "runs.chain_head")?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, payload_json, prev_hash, entry_hash,
                   t_ms, track_id, state_id, state_name, group_name
            FROM track_events WHERE run_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query([run_id])?;
        let mut expected_prev = [0u8; 32];
        let mut count = 0usize;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let prev_hash = blob32(row.get(2)?, "track_events.prev_hash")?;
            let entry_hash = blob32(row.get(3)?, "track_events.entry_hash")?;
            if prev_hash != expected_prev {
                return Err(anyhow!("run {}: prev_hash mismatch at event {}", run_id, id));
            }
            let event: Event = serde_json::from_str(&payload)
                .map_err(|e| anyhow!("run {}: event {} payload invalid: {}", run_id, id, e))?;
            let computed = hash_entry(&prev_hash, &event_payload(&event)?);
            if computed != entry_hash {
                return Err(anyhow!("run {}: entry_hash mismatch at event {}", run_id, id));
            }
            let columns = EventColumns {
                t_ms: row.get(4)?,
                track_id: row.get(5)?,
                state_id: row.get(6)?,
                state_name: row.get(7)?,
                group_name: row.get(8)?,
            };
            if let Err(field) = columns.check(&event) {
                return Err(anyhow!(
                    "run {}: column {} of event {} does not match its payload",
                    run_id,
                    field,
                    id
                ));
            }
            on_entry(id, entry_hash);
            expected_prev = entry_hash;
            count += 1;
        }
        if usize::try_from(recorded_count).ok() != Some(count) {
            return Err(anyhow!(
                "run {}: recorded {} events, found {}",
                run_id,
                recorded_count,
                count
            ));
        }
        if expected_prev != recorded_head {
            return Err(anyhow!("run {}: committed chain head mismatch", run_id));
        }
        reports.push(VerifyReport {
            run_id: Some(run_id),
            event_count: count,
            chain_head: expected_prev,
        });
    }
    Ok(reports)
}

/// Queryable copies of the sealed payload fields in `track_events`.
struct EventColumns {
    t_ms: f64,
    track_id: i64,
    state_id: i64,
    state_name: String,
    group_name: String,
}

impl EventColumns {
    /// Name of the first column that disagrees with `event`.
    fn check(&self, event: &Event) -> std::result::Result<(), &'static str> {
        if self.t_ms != event.t_ms {
            return Err("t_ms");
        }
        if u64::try_from(self.track_id).ok() != Some(event.track_id) {
            return Err("track_id");
        }
        if self.state_id != i64::from(event.state_id) {
            return Err("state_id");
        }
        if self.state_name != event.state_name {
            return Err("state_name");
        }
        if self.group_name != event.group.as_str() {
            return Err("group_name");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Group;
    use crate::log::EventLog;
    use crate::storage::SqliteEventLogStore;

    fn sample_events() -> Vec<Event> {
        vec![
            Event {
                t_ms: 800.0,
                track_id: 1,
                state_id: 2,
                state_name: "red".to_string(),
                group: Group::Red,
            },
            Event {
                t_ms: 4200.0,
                track_id: 1,
                state_id: 0,
                state_name: "green_straight".to_string(),
                group: Group::Green,
            },
        ]
    }

    #[test]
    fn document_round_trip_verifies() -> Result<()> {
        let doc = EventLogDocument::new("0.0.0-test", sample_events())?;
        let report = verify_document(&doc)?;
        assert_eq!(report.event_count, 2);
        Ok(())
    }

    #[test]
    fn tampered_document_fails() -> Result<()> {
        let mut doc = EventLogDocument::new("0.0.0-test", sample_events())?;
        doc.events[1].state_id = 1;
        assert!(verify_document(&doc).is_err());

        let mut doc = EventLogDocument::new("0.0.0-test", sample_events())?;
        doc.event_count = 5;
        assert!(verify_document(&doc).is_err());
        Ok(())
    }

    #[test]
    fn sqlite_runs_verify_and_detect_tampering() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let mut store = SqliteEventLogStore::with_connection(conn, "0.0.0-test")?;
        let mut log = EventLog::new();
        for ev in sample_events() {
            log.append(ev)?;
        }
        log.flush(&mut store)?;

        let mut seen = 0;
        let reports = verify_sqlite_with(store.connection(), |_, _| seen += 1)?;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].chain_head, log.head());
        assert_eq!(seen, 2);

        store.connection().execute(
            "UPDATE track_events SET payload_json = replace(payload_json, 'green_straight', 'green_left')",
            [],
        )?;
        assert!(verify_sqlite_with(store.connection(), |_, _| {}).is_err());
        Ok(())
    }

    #[test]
    fn sqlite_column_edits_are_detected() -> Result<()> {
        let edits = [
            "UPDATE track_events SET t_ms = 5.0 WHERE id = 1",
            "UPDATE track_events SET track_id = 9 WHERE id = 1",
            "UPDATE track_events SET state_id = 0 WHERE id = 1",
            "UPDATE track_events SET state_name = 'green_straight' WHERE id = 1",
            "UPDATE track_events SET group_name = 'GREEN' WHERE id = 1",
        ];
        for edit in edits {
            let conn = Connection::open_in_memory()?;
            let mut store = SqliteEventLogStore::with_connection(conn, "0.0.0-test")?;
            let mut log = EventLog::new();
            for ev in sample_events() {
                log.append(ev)?;
            }
            log.flush(&mut store)?;
            verify_sqlite_with(store.connection(), |_, _| {})?;

            store.connection().execute(edit, [])?;
            assert!(
                verify_sqlite_with(store.connection(), |_, _| {}).is_err(),
                "{edit} went undetected"
            );
        }
        Ok(())
    }
}
