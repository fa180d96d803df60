#![forbid(unsafe_code)]
//! Per-topic head cache.
//!
//! A [`TopicCache`] owns two background tasks: an ingest loop folding the
//! live consumer stream into the shared state, and a cleanup loop discarding
//! entries the durable store has caught up with. It also owns the query
//! path, which answers from a snapshot or parks a listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::HeadConfig;
use crate::consumer::{ConsumerFactory, LogConsumer};
use crate::error::{HeadError, Result};
use crate::journal::{Offset, Partition};
use crate::metrics;
use crate::pointers::PointerSource;
use crate::state::{resolve, CacheState, HeadResult, Listener, PartitionEntry};

/// Partition discovery retry bounds: full-jitter backoff.
const DISCOVERY_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(3);
const BACKOFF_CAP: Duration = Duration::from_millis(300);

/// Cache of the journal head for a single topic.
pub struct TopicCache {
    topic: String,
    state: Arc<RwLock<CacheState>>,
    poisoned: Arc<AtomicBool>,
    ingest: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl TopicCache {
    /// Build the cache for one topic: seed from the durable pointers,
    /// discover and assign partitions, seek past the pointers, and spawn
    /// the ingest and cleanup loops.
    pub async fn new(
        topic: &str,
        config: &HeadConfig,
        consumers: &dyn ConsumerFactory,
        pointer_source: Arc<dyn PointerSource>,
    ) -> Result<Self> {
        config.validate()?;

        let pointers = pointer_source.pointers(topic).await?;

        let mut consumer = consumers
            .create(&config.consumer.for_head_cache())
            .await?;
        let partitions = discover_partitions(consumer.as_ref(), topic).await?;

        consumer.assign(topic, &partitions).await?;
        let start_offsets: HashMap<Partition, Offset> = partitions
            .iter()
            .map(|&partition| {
                (
                    partition,
                    pointers.get(&partition).map_or(0, |&pointer| pointer + 1),
                )
            })
            .collect();
        consumer.seek(topic, &start_offsets).await?;

        let state = Arc::new(RwLock::new(CacheState::seeded(&pointers)));
        let poisoned = Arc::new(AtomicBool::new(false));

        let ingest = tokio::spawn(ingest_loop(
            topic.to_string(),
            consumer,
            state.clone(),
            poisoned.clone(),
            config.poll_timeout,
            config.max_size,
        ));
        let cleanup = tokio::spawn(cleanup_loop(
            topic.to_string(),
            pointer_source,
            state.clone(),
            config.clean_interval,
        ));

        Ok(Self {
            topic: topic.to_string(),
            state,
            poisoned,
            ingest,
            cleanup,
        })
    }

    /// Resolve a head query, waiting for ingest when the cache has not yet
    /// observed `offset` for the partition.
    ///
    /// Carries no timeout of its own; callers bound the wait. A cancelled
    /// waiter is purged from the listener list on the next state update.
    pub async fn get(&self, id: &str, partition: Partition, offset: Offset) -> HeadResult {
        if self.poisoned.load(Ordering::SeqCst) {
            return HeadResult::Invalid;
        }

        if let Some(result) = resolve(&self.state.read().entries, id, partition, offset) {
            return result;
        }

        // Behind: re-check under the write lock (an update may have landed
        // since the snapshot), then park a listener.
        let rx = {
            let mut state = self.state.write();
            if self.poisoned.load(Ordering::SeqCst) {
                return HeadResult::Invalid;
            }
            match resolve(&state.entries, id, partition, offset) {
                Some(result) => return result,
                None => {
                    let (listener, rx) = Listener::new(id.to_string(), partition, offset);
                    state.listeners.push(listener);
                    metrics::record_listeners(&self.topic, state.listeners.len());
                    rx
                }
            }
        };

        // A dropped sender means the cache was torn down or poisoned while
        // we waited; fail open.
        rx.await.unwrap_or(HeadResult::Invalid)
    }

    /// Whether the ingest loop has failed terminally.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Topic this cache serves.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop both background loops and fail any pending waiters.
    pub fn close(&self) {
        self.ingest.abort();
        self.cleanup.abort();
        self.state.write().fail_listeners();
    }
}

impl Drop for TopicCache {
    fn drop(&mut self) {
        self.ingest.abort();
        self.cleanup.abort();
    }
}

async fn discover_partitions(
    consumer: &dyn LogConsumer,
    topic: &str,
) -> Result<Vec<Partition>> {
    let mut last_error = String::new();
    for attempt in 0..DISCOVERY_ATTEMPTS {
        match consumer.partitions(topic).await {
            Ok(partitions) => return Ok(partitions),
            Err(err) => {
                last_error = err.to_string();
                let ceiling = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(attempt));
                let delay_ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
    Err(HeadError::PartitionDiscovery {
        topic: topic.to_string(),
        attempts: DISCOVERY_ATTEMPTS,
        reason: last_error,
    })
}

async fn ingest_loop(
    topic: String,
    mut consumer: Box<dyn LogConsumer>,
    state: Arc<RwLock<CacheState>>,
    poisoned: Arc<AtomicBool>,
    poll_timeout: Duration,
    max_size: usize,
) {
    loop {
        let polled = match consumer.poll(poll_timeout).await {
            Ok(polled) => polled,
            Err(err) => {
                error!(%topic, %err, "ingest loop failed, marking topic cache poisoned");
                poisoned.store(true, Ordering::SeqCst);
                state.write().fail_listeners();
                return;
            }
        };
        if polled.is_empty() {
            continue;
        }

        let first_timestamp = polled
            .values()
            .flat_map(|records| records.iter().map(|r| r.timestamp))
            .min();
        let batch: HashMap<Partition, PartitionEntry> = polled
            .iter()
            .filter_map(|(&partition, records)| {
                PartitionEntry::of(partition, records).map(|entry| (partition, entry))
            })
            .collect();
        let new_entries: usize = batch.values().map(|entry| entry.entries.len()).sum();

        let (satisfied, pending) = {
            let mut state = state.write();
            state.combine_and_trim(batch, max_size);
            let satisfied = state.sweep_listeners();
            (satisfied, state.listeners.len())
        };
        // Completions fire only after the state change above is visible.
        for (listener, result) in satisfied {
            listener.complete(result);
        }

        let delivery_latency = first_timestamp
            .map(|ts| Utc::now().timestamp_millis().saturating_sub(ts).max(0) as u64)
            .map(Duration::from_millis)
            .unwrap_or_default();
        metrics::record_round(&topic, new_entries, pending, delivery_latency);
    }
}

async fn cleanup_loop(
    topic: String,
    pointer_source: Arc<dyn PointerSource>,
    state: Arc<RwLock<CacheState>>,
    clean_interval: Duration,
) {
    loop {
        tokio::time::sleep(clean_interval).await;
        match pointer_source.pointers(&topic).await {
            Ok(pointers) => {
                let removed = state.write().remove_until(&pointers);
                if removed > 0 {
                    debug!(%topic, removed, "cleanup removed replicated entries");
                }
            }
            // Cleanup is advisory: entry growth stays bounded by trimming.
            Err(err) => warn!(%topic, %err, "cleanup cycle failed, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryLog, SharedLog};
    use crate::consumer::{ConsumerConfig, MemoryConsumerFactory, Record};
    use crate::journal::{JournalAction, JournalHead, JournalInfo, SeqRange};
    use crate::pointers::MemoryPointers;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn append(from: u64, to: u64) -> JournalAction {
        JournalAction::Append {
            range: SeqRange::new(from, to),
        }
    }

    fn fast_config() -> HeadConfig {
        HeadConfig {
            poll_timeout: Duration::from_millis(5),
            clean_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn cache_over(
        log: &SharedLog,
        pointers: &Arc<MemoryPointers>,
        config: HeadConfig,
    ) -> TopicCache {
        let factory = MemoryConsumerFactory::new(log.clone());
        TopicCache::new("journal", &config, &factory, pointers.clone())
            .await
            .unwrap()
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_construction_fails_without_partitions() {
        let log: SharedLog = Arc::new(MemoryLog::new());
        let factory = MemoryConsumerFactory::new(log);
        let pointers: Arc<MemoryPointers> = Arc::new(MemoryPointers::new());

        let result = TopicCache::new("journal", &fast_config(), &factory, pointers).await;
        assert!(matches!(
            result,
            Err(HeadError::PartitionDiscovery { attempts, .. }) if attempts == DISCOVERY_ATTEMPTS
        ));
    }

    #[tokio::test]
    async fn test_get_non_empty_after_ingest() {
        let log: SharedLog = Arc::new(MemoryLog::new());
        log.create_topic("journal", 1);
        log.append_action("journal", 0, "b", &append(1, 5));

        let pointers = Arc::new(MemoryPointers::new());
        let cache = cache_over(&log, &pointers, fast_config()).await;

        // No pointer seeds partition 0, so the answer is Invalid until the
        // ingest loop has observed the record.
        let expected = HeadResult::Valid(JournalInfo::NonEmpty(JournalHead {
            seq_nr: 5,
            delete_to: None,
        }));
        for _ in 0..200 {
            if cache.get("b", 0, 0).await == expected {
                cache.close();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("head of 'b' never became visible");
    }

    #[tokio::test]
    async fn test_seek_starts_past_durable_pointer() {
        let log: SharedLog = Arc::new(MemoryLog::new());
        log.create_topic("journal", 1);
        // Offsets 0..=10 are durable; the record at 10 must never be read.
        for i in 0..=10 {
            log.append_action("journal", 0, "stale", &append(i + 1, i + 1));
        }
        let pointers = Arc::new(MemoryPointers::new());
        pointers.set("journal", 0, 10);

        let cache = cache_over(&log, &pointers, fast_config()).await;

        // Nothing past the pointer yet: an id with no entry answers Empty
        // at the seeded offset.
        assert_eq!(
            cache.get("stale", 0, 10).await,
            HeadResult::Valid(JournalInfo::Empty)
        );
        cache.close();
    }

    #[tokio::test]
    async fn test_behind_query_wakes_on_ingest() {
        let log: SharedLog = Arc::new(MemoryLog::new());
        log.create_topic("journal", 1);
        let pointers = Arc::new(MemoryPointers::new());
        pointers.set("journal", 0, 30);

        let cache = Arc::new(cache_over(&log, &pointers, fast_config()).await);

        let waiting = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("c", 0, 31).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        // Advance partition 0 to offset 31 with an action for another id.
        for _ in 0..=31 {
            log.append_action("journal", 0, "other", &append(1, 1));
        }

        let result = waiting.await.unwrap();
        assert_eq!(result, HeadResult::Valid(JournalInfo::Empty));
        cache.close();
    }

    #[tokio::test]
    async fn test_cleanup_unsets_passed_trim_watermark() {
        let log: SharedLog = Arc::new(MemoryLog::new());
        log.create_topic("journal", 1);
        let pointers = Arc::new(MemoryPointers::new());
        pointers.set("journal", 0, 0);

        let config = HeadConfig {
            max_size: 2,
            ..fast_config()
        };
        let cache = cache_over(&log, &pointers, config).await;

        // Offset 0 was consumed pre-seek; 1..=3 carry three distinct ids,
        // blowing the cap and trimming the partition.
        for id in ["a", "b", "c", "d"] {
            log.append_action("journal", 0, id, &append(1, 1));
        }
        eventually(|| cache.state.read().entries[&0].trimmed.is_some()).await;
        assert_eq!(cache.get("nobody", 0, 1).await, HeadResult::Invalid);

        // Once the durable store passes the watermark, cleanup clears it.
        pointers.set("journal", 0, 3);
        eventually(|| cache.state.read().entries[&0].trimmed.is_none()).await;
        cache.close();
    }

    // ── Ingest failure ───────────────────────────────────────────────────

    struct FailingConsumer;

    #[async_trait]
    impl LogConsumer for FailingConsumer {
        async fn assign(&mut self, _topic: &str, _partitions: &[Partition]) -> Result<()> {
            Ok(())
        }
        async fn seek(
            &mut self,
            _topic: &str,
            _offsets: &HashMap<Partition, Offset>,
        ) -> Result<()> {
            Ok(())
        }
        async fn poll(
            &mut self,
            _timeout: Duration,
        ) -> Result<HashMap<Partition, Vec<Record>>> {
            Err(HeadError::Consumer("broker gone".into()))
        }
        async fn partitions(&self, _topic: &str) -> Result<Vec<Partition>> {
            Ok(vec![0])
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl ConsumerFactory for FailingFactory {
        async fn create(&self, _config: &ConsumerConfig) -> Result<Box<dyn LogConsumer>> {
            Ok(Box::new(FailingConsumer))
        }
    }

    #[tokio::test]
    async fn test_ingest_failure_poisons_and_fails_open() {
        let pointers: Arc<MemoryPointers> = Arc::new(MemoryPointers::new());
        pointers.set("journal", 0, 10);

        let cache = TopicCache::new("journal", &fast_config(), &FailingFactory, pointers)
            .await
            .unwrap();

        eventually(|| cache.is_poisoned()).await;
        assert_eq!(cache.get("a", 0, 99).await, HeadResult::Invalid);
        assert_eq!(cache.get("a", 0, 5).await, HeadResult::Invalid);
        cache.close();
    }
}
