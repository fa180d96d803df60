#![forbid(unsafe_code)]
//! In-memory partitioned journal log.
//!
//! Backs the bundled [`MemoryConsumer`](crate::consumer::MemoryConsumer) and
//! [`MemoryPointers`](crate::pointers::MemoryPointers) so the cache can be
//! exercised end-to-end without an external broker. Offsets are assigned per
//! partition, densely, starting at 0.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;

use crate::journal::{JournalAction, Offset, Partition};

/// A raw record as stored in (and fetched from) the log.
///
/// The `header` carries the JSON-encoded [`JournalAction`]; decoding happens
/// at the consumer boundary so that non-journal records can flow through the
/// same topic without breaking the cache.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Aggregate id the record belongs to.
    pub id: String,
    /// Broker-assigned timestamp (epoch millis).
    pub timestamp: i64,
    /// Offset within the partition.
    pub offset: Offset,
    /// Encoded action header.
    pub header: Bytes,
}

/// An in-memory, append-only log for a single partition.
#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<LogRecord>,
    /// Offset of the next record to be appended.
    high_watermark: Offset,
}

impl PartitionLog {
    fn append(&mut self, id: String, header: Bytes) -> Offset {
        let offset = self.high_watermark;
        self.records.push(LogRecord {
            id,
            timestamp: Utc::now().timestamp_millis(),
            offset,
            header,
        });
        self.high_watermark += 1;
        offset
    }

    fn read(&self, from: Offset, max: usize) -> Vec<LogRecord> {
        if from >= self.high_watermark {
            return Vec::new();
        }
        self.records
            .iter()
            .filter(|r| r.offset >= from)
            .take(max)
            .cloned()
            .collect()
    }
}

/// A multi-topic, multi-partition in-memory journal log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    topics: RwLock<HashMap<String, Vec<RwLock<PartitionLog>>>>,
}

/// Shared handle to a [`MemoryLog`].
pub type SharedLog = Arc<MemoryLog>;

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with the given partition count. Creating an existing
    /// topic is a no-op.
    pub fn create_topic(&self, topic: &str, partitions: Partition) {
        let mut topics = self.topics.write();
        topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions).map(|_| RwLock::new(PartitionLog::default())).collect()
        });
    }

    /// Append a raw record and return its assigned offset.
    ///
    /// Returns `None` when the topic or partition does not exist.
    pub fn append_raw(
        &self,
        topic: &str,
        partition: Partition,
        id: &str,
        header: Bytes,
    ) -> Option<Offset> {
        let topics = self.topics.read();
        let log = topics.get(topic)?.get(partition as usize)?;
        let offset = log.write().append(id.to_string(), header);
        Some(offset)
    }

    /// Append a journal action, JSON-encoding its header.
    pub fn append_action(
        &self,
        topic: &str,
        partition: Partition,
        id: &str,
        action: &JournalAction,
    ) -> Option<Offset> {
        let header = serde_json::to_vec(action).expect("action header serializes");
        self.append_raw(topic, partition, id, Bytes::from(header))
    }

    /// Read up to `max` records of a partition starting at `from`.
    pub fn fetch(
        &self,
        topic: &str,
        partition: Partition,
        from: Offset,
        max: usize,
    ) -> Vec<LogRecord> {
        let topics = self.topics.read();
        match topics.get(topic).and_then(|p| p.get(partition as usize)) {
            Some(log) => log.read().read(from, max),
            None => Vec::new(),
        }
    }

    /// Partitions of a topic, when it exists.
    pub fn partitions(&self, topic: &str) -> Option<Vec<Partition>> {
        let topics = self.topics.read();
        topics
            .get(topic)
            .map(|p| (0..p.len() as Partition).collect())
    }

    /// Offset of the next record to be appended to a partition.
    pub fn high_watermark(&self, topic: &str, partition: Partition) -> Option<Offset> {
        let topics = self.topics.read();
        topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(|log| log.read().high_watermark)
    }
}
