#![forbid(unsafe_code)]
//! Log consumer adapter.
//!
//! Presents a typed cursor over a partitioned journal log: assign, seek,
//! poll, list partitions. Records whose action header fails to decode are
//! dropped here, at the adapter boundary: they are not journal actions and
//! the cache never sees them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::{LogRecord, SharedLog};
use crate::error::{HeadError, Result};
use crate::journal::{JournalAction, Offset, Partition};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Offset reset policy when no position has been seeked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoOffsetReset {
    /// Start from the earliest available offset.
    Earliest,
    /// Start from the latest (tail) offset.
    Latest,
}

impl Default for AutoOffsetReset {
    fn default() -> Self {
        Self::Earliest
    }
}

/// Configuration passed through to the log consumer.
///
/// The head cache overrides the group, offset-reset, and auto-commit fields
/// regardless of what the caller supplies; see [`ConsumerConfig::for_head_cache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group identifier; `None` runs without a group.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Offset reset policy when no committed offset exists.
    #[serde(default)]
    pub auto_offset_reset: AutoOffsetReset,
    /// Whether to automatically commit offsets after polling.
    #[serde(default)]
    pub enable_auto_commit: bool,
    /// Maximum number of records returned per poll.
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

fn default_max_poll_records() -> usize {
    500
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: None,
            auto_offset_reset: AutoOffsetReset::default(),
            enable_auto_commit: false,
            max_poll_records: default_max_poll_records(),
        }
    }
}

impl ConsumerConfig {
    /// The same config with the head-cache overrides applied: earliest
    /// offsets, no consumer group, manual commit disabled.
    pub fn for_head_cache(&self) -> Self {
        Self {
            group_id: None,
            auto_offset_reset: AutoOffsetReset::Earliest,
            enable_auto_commit: false,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A decoded journal record as handed to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Aggregate id the action belongs to.
    pub id: String,
    /// Broker-assigned timestamp (epoch millis).
    pub timestamp: i64,
    /// Offset within the partition.
    pub offset: Offset,
    /// The decoded journal action.
    pub action: JournalAction,
}

fn decode_record(raw: &LogRecord) -> Option<Record> {
    match serde_json::from_slice::<JournalAction>(&raw.header) {
        Ok(action) => Some(Record {
            id: raw.id.clone(),
            timestamp: raw.timestamp,
            offset: raw.offset,
            action,
        }),
        Err(err) => {
            debug!(offset = raw.offset, %err, "dropping undecodable record");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer contract
// ---------------------------------------------------------------------------

/// A typed cursor over a partitioned journal log.
///
/// One consumer is owned by exactly one ingest task; implementations release
/// the underlying connection on drop.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Bind the consumer to exactly these partitions of a topic.
    async fn assign(&mut self, topic: &str, partitions: &[Partition]) -> Result<()>;

    /// Set the starting position per partition.
    async fn seek(&mut self, topic: &str, offsets: &HashMap<Partition, Offset>) -> Result<()>;

    /// Fetch new records, waiting at most `timeout`.
    ///
    /// May return an empty map; never blocks indefinitely.
    async fn poll(&mut self, timeout: Duration) -> Result<HashMap<Partition, Vec<Record>>>;

    /// List the currently known partitions of a topic.
    ///
    /// Fails with [`HeadError::NoPartitions`] when the topic has none.
    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>>;
}

/// Creates consumers for the head cache, one per topic.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    /// Create a fresh consumer with the given configuration.
    async fn create(&self, config: &ConsumerConfig) -> Result<Box<dyn LogConsumer>>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Consumer over an in-process [`MemoryLog`](crate::broker::MemoryLog).
pub struct MemoryConsumer {
    log: SharedLog,
    config: ConsumerConfig,
    assigned_topic: Option<String>,
    /// Next offset to fetch, per assigned partition.
    positions: HashMap<Partition, Offset>,
}

impl MemoryConsumer {
    /// Create a consumer over a shared in-memory log.
    pub fn new(log: SharedLog, config: ConsumerConfig) -> Self {
        Self {
            log,
            config,
            assigned_topic: None,
            positions: HashMap::new(),
        }
    }

    fn fetch_assigned(&mut self) -> HashMap<Partition, Vec<Record>> {
        let topic = match &self.assigned_topic {
            Some(topic) => topic.clone(),
            None => return HashMap::new(),
        };

        let max = self.config.max_poll_records;
        let per_partition = (max / self.positions.len().max(1)).max(1);
        let mut polled = HashMap::new();

        for (&partition, position) in self.positions.iter_mut() {
            let raw = self.log.fetch(&topic, partition, *position, per_partition);
            if let Some(last) = raw.last() {
                *position = last.offset + 1;
            }
            let records: Vec<Record> = raw.iter().filter_map(decode_record).collect();
            if !records.is_empty() {
                polled.insert(partition, records);
            }
        }
        polled
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn assign(&mut self, topic: &str, partitions: &[Partition]) -> Result<()> {
        self.assigned_topic = Some(topic.to_string());
        self.positions = partitions.iter().map(|&p| (p, 0)).collect();
        Ok(())
    }

    async fn seek(&mut self, topic: &str, offsets: &HashMap<Partition, Offset>) -> Result<()> {
        if self.assigned_topic.as_deref() != Some(topic) {
            return Err(HeadError::Consumer(format!(
                "seek on unassigned topic '{topic}'"
            )));
        }
        for (&partition, &offset) in offsets {
            if let Some(position) = self.positions.get_mut(&partition) {
                *position = offset;
            }
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<HashMap<Partition, Vec<Record>>> {
        let polled = self.fetch_assigned();
        if !polled.is_empty() {
            return Ok(polled);
        }
        // Nothing available: honour the timeout as an upper bound before
        // the one retry, so callers never busy-spin on an idle topic.
        tokio::time::sleep(timeout).await;
        Ok(self.fetch_assigned())
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>> {
        match self.log.partitions(topic) {
            Some(partitions) if !partitions.is_empty() => Ok(partitions),
            _ => Err(HeadError::NoPartitions(topic.to_string())),
        }
    }
}

/// Factory producing [`MemoryConsumer`]s over one shared log.
pub struct MemoryConsumerFactory {
    log: SharedLog,
}

impl MemoryConsumerFactory {
    /// Create a factory over a shared in-memory log.
    pub fn new(log: SharedLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ConsumerFactory for MemoryConsumerFactory {
    async fn create(&self, config: &ConsumerConfig) -> Result<Box<dyn LogConsumer>> {
        Ok(Box::new(MemoryConsumer::new(
            self.log.clone(),
            config.clone(),
        )))
    }
}
