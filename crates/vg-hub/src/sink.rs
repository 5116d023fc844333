//! In-memory [`LogSink`]: a bounded ring of the most recent records.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use vg_core::{LogSink, NewRecord, Record, RecordId, SinkError};

struct Ring {
    next_id: RecordId,
    records: VecDeque<Record>,
}

pub struct MemorySink {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                next_id: 1,
                records: VecDeque::with_capacity(capacity),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot, oldest first.
    pub fn records(&self) -> Vec<Record> {
        self.ring
            .lock()
            .map(|ring| ring.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|ring| ring.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: NewRecord) -> Result<Record, SinkError> {
        record.validate()?;
        let mut ring = self.ring.lock().map_err(|_| SinkError::Unavailable)?;
        let record = record.into_record(ring.next_id, Utc::now());
        ring.next_id += 1;
        if ring.records.len() >= self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: &str) -> NewRecord {
        NewRecord {
            connector: "posts".into(),
            context: "post".into(),
            action: action.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ids_increase_and_ring_evicts_oldest() {
        let sink = MemorySink::new(2);
        for action in ["a", "b", "c"] {
            sink.write(entry(action)).unwrap();
        }
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[1].action, "c");
    }

    #[test]
    fn test_rejects_invalid_record() {
        let sink = MemorySink::new(2);
        assert!(matches!(
            sink.write(NewRecord::default()),
            Err(SinkError::Invalid(_))
        ));
        assert!(sink.is_empty());
    }
}
