//! Deadlock event log
//!
//! Append-only record of every resolved deadlock. Kept in memory for
//! dashboards and optionally mirrored to a JSON-lines journal file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use super::detector::Cycle;
use super::error::LockError;
use crate::core_types::TxId;

/// One resolved deadlock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockEvent {
    pub id: u64,
    pub victim: TxId,
    /// Closed loop, e.g. `[a, b, a]`
    pub cycle: Vec<TxId>,
    /// Transaction whose request exposed the cycle
    pub detected_by: TxId,
    pub created_at: DateTime<Utc>,
}

/// Writes one JSON object per line
pub struct EventJournal {
    writer: BufWriter<File>,
    entry_count: u64,
}

impl EventJournal {
    /// Open (or create) a journal at `path` in append mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            entry_count: 0,
        })
    }

    pub fn write_event(&mut self, event: &DeadlockEvent) -> Result<(), LockError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.entry_count += 1;
        Ok(())
    }

    /// Entries written through this handle
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}

#[derive(Default)]
pub struct DeadlockLog {
    events: RwLock<Vec<DeadlockEvent>>,
    journal: Option<Mutex<EventJournal>>,
}

impl DeadlockLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: EventJournal) -> Self {
        Self {
            journal: Some(Mutex::new(journal)),
            ..Self::default()
        }
    }

    /// Append an event for `cycle`. Call exactly once per resolved cycle.
    ///
    /// Ids are assigned under the events lock and the journal is written
    /// before it is released, so ids, `events()` and the journal share one
    /// order.
    pub fn record(&self, cycle: &Cycle, detected_by: TxId) -> DeadlockEvent {
        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let event = DeadlockEvent {
            id: events.len() as u64 + 1,
            victim: cycle.victim(),
            cycle: cycle.path().to_vec(),
            detected_by,
            created_at: Utc::now(),
        };
        events.push(event.clone());

        if let Some(journal) = &self.journal {
            let mut journal = journal.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = journal.write_event(&event) {
                error!(
                    target: "LOCK",
                    event_id = event.id,
                    code = e.code(),
                    error = %e,
                    "Failed to journal deadlock event"
                );
            }
        }

        event
    }

    /// Copy of every event, oldest first
    pub fn events(&self) -> Vec<DeadlockEvent> {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::detector::DeadlockDetector;

    fn two_party_cycle() -> Cycle {
        DeadlockDetector::detect_cycle_from(TxId(2), &[(TxId(1), TxId(2)), (TxId(2), TxId(1))])
            .unwrap()
    }

    #[test]
    fn test_record_appends() {
        let log = DeadlockLog::new();
        let event = log.record(&two_party_cycle(), TxId(2));

        assert_eq!(event.id, 1);
        assert_eq!(event.victim, TxId(2));
        assert_eq!(event.cycle, vec![TxId(2), TxId(1), TxId(2)]);
        assert_eq!(log.len(), 1);
        assert_eq!(log.events(), vec![event]);
    }

    #[test]
    fn test_concurrent_records_keep_id_order() {
        use std::sync::Arc;
        use std::thread;

        let path = std::env::temp_dir().join(format!(
            "deadlock_journal_order_{}_{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let log = Arc::new(DeadlockLog::with_journal(EventJournal::open(&path).unwrap()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        log.record(&two_party_cycle(), TxId(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ids: Vec<u64> = log.events().iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=400).collect::<Vec<u64>>());

        let content = std::fs::read_to_string(&path).unwrap();
        let journaled: Vec<u64> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(journaled, ids);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_journal_writes_json_lines() {
        let path = std::env::temp_dir().join(format!(
            "deadlock_journal_{}_{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        let log = DeadlockLog::with_journal(EventJournal::open(&path).unwrap());
        log.record(&two_party_cycle(), TxId(2));
        log.record(&two_party_cycle(), TxId(1));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["victim"], 2);
        assert_eq!(first["cycle"], serde_json::json!([2, 1, 2]));
        assert_eq!(first["detected_by"], 2);

        let _ = std::fs::remove_file(&path);
    }
}
