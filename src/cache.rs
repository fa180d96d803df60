#![forbid(unsafe_code)]
//! Top-level head cache registry.
//!
//! Owns one lazily created [`TopicCache`] per topic and routes queries to
//! it. Closing swaps the registry into a closed sentinel state (subsequent
//! queries fail with [`HeadError::Closed`]) and tears the topic caches down
//! in parallel. Optional metering and logging decorators wrap the registry
//! without changing its semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::HeadConfig;
use crate::consumer::ConsumerFactory;
use crate::error::{HeadError, Result};
use crate::journal::{JournalInfo, Offset, Partition};
use crate::metrics::{self, GetOutcome};
use crate::pointers::PointerSource;
use crate::state::HeadResult;
use crate::topic::TopicCache;

/// Query access to the journal head, keyed by `(topic, id)`.
#[async_trait]
pub trait Heads: Send + Sync {
    /// Answer whether the journal of `(topic, id)` is known to be empty,
    /// has pending entries, or cannot be answered from memory.
    async fn get(
        &self,
        topic: &str,
        id: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<HeadResult>;

    /// Tear the cache down; all subsequent queries fail with `Closed`.
    async fn close(&self);
}

/// Registry of per-topic head caches.
pub struct HeadCache {
    config: HeadConfig,
    consumers: Arc<dyn ConsumerFactory>,
    pointers: Arc<dyn PointerSource>,
    topics: DashMap<String, Arc<OnceCell<Arc<TopicCache>>>>,
    closed: AtomicBool,
}

impl HeadCache {
    /// Create the registry. Topic caches are created lazily, on the first
    /// query for their topic.
    pub fn new(
        config: HeadConfig,
        consumers: Arc<dyn ConsumerFactory>,
        pointers: Arc<dyn PointerSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            consumers,
            pointers,
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn topic_cache(&self, topic: &str) -> Result<Arc<TopicCache>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HeadError::Closed);
        }

        let cell = {
            let entry = self
                .topics
                .entry(topic.to_string())
                .or_default();
            entry.value().clone()
        };

        let cache = cell
            .get_or_try_init(|| async {
                TopicCache::new(
                    topic,
                    &self.config,
                    self.consumers.as_ref(),
                    self.pointers.clone(),
                )
                .await
                .map(Arc::new)
            })
            .await?
            .clone();

        // A close that raced the lazy init above swept the map before the
        // new cache landed in it; finish its teardown here.
        if self.closed.load(Ordering::SeqCst) {
            cache.close();
            return Err(HeadError::Closed);
        }
        Ok(cache)
    }
}

#[async_trait]
impl Heads for HeadCache {
    async fn get(
        &self,
        topic: &str,
        id: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<HeadResult> {
        let cache = self.topic_cache(topic).await?;
        Ok(cache.get(id, partition, offset).await)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cells: Vec<Arc<OnceCell<Arc<TopicCache>>>> = self
            .topics
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.topics.clear();

        let teardowns = cells
            .into_iter()
            .filter_map(|cell| cell.get().cloned())
            .map(|cache| async move { cache.close() });
        join_all(teardowns).await;
    }
}

// ---------------------------------------------------------------------------
// Decorators
// ---------------------------------------------------------------------------

fn classify(result: &Result<HeadResult>) -> GetOutcome {
    match result {
        Ok(HeadResult::Valid(JournalInfo::Empty)) => GetOutcome::Replicated,
        Ok(HeadResult::Valid(JournalInfo::NonEmpty(_))) => GetOutcome::NotReplicated,
        Ok(HeadResult::Invalid) => GetOutcome::Invalid,
        Err(_) => GetOutcome::Failure,
    }
}

/// Records per-call latency and outcome classification.
pub struct MeteredHeads<H> {
    inner: H,
}

impl<H> MeteredHeads<H> {
    /// Wrap a head source with metering.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Heads> Heads for MeteredHeads<H> {
    async fn get(
        &self,
        topic: &str,
        id: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<HeadResult> {
        let start = Instant::now();
        let result = self.inner.get(topic, id, partition, offset).await;
        metrics::record_get(topic, classify(&result), start.elapsed());
        result
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Logs every query at debug level.
pub struct LoggedHeads<H> {
    inner: H,
}

impl<H> LoggedHeads<H> {
    /// Wrap a head source with debug logging.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Heads> Heads for LoggedHeads<H> {
    async fn get(
        &self,
        topic: &str,
        id: &str,
        partition: Partition,
        offset: Offset,
    ) -> Result<HeadResult> {
        let start = Instant::now();
        let result = self.inner.get(topic, id, partition, offset).await;
        debug!(
            %topic,
            %id,
            partition,
            offset,
            elapsed_ms = start.elapsed().as_millis() as u64,
            result = ?result.as_ref().map(|r| *r).map_err(|e| e.to_string()),
            "head query"
        );
        result
    }

    async fn close(&self) {
        debug!("closing head cache");
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryLog, SharedLog};
    use crate::consumer::{ConsumerConfig, LogConsumer, MemoryConsumerFactory};
    use crate::journal::{JournalAction, SeqRange};
    use crate::pointers::MemoryPointers;
    use std::sync::atomic::AtomicUsize;

    struct CountingFactory {
        inner: MemoryConsumerFactory,
        created: AtomicUsize,
    }

    #[async_trait]
    impl ConsumerFactory for CountingFactory {
        async fn create(&self, config: &ConsumerConfig) -> Result<Box<dyn LogConsumer>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.inner.create(config).await
        }
    }

    fn setup(topics: &[&str]) -> (SharedLog, Arc<CountingFactory>, Arc<MemoryPointers>) {
        let log: SharedLog = Arc::new(MemoryLog::new());
        for topic in topics {
            log.create_topic(topic, 1);
        }
        let factory = Arc::new(CountingFactory {
            inner: MemoryConsumerFactory::new(log.clone()),
            created: AtomicUsize::new(0),
        });
        (log, factory, Arc::new(MemoryPointers::new()))
    }

    #[tokio::test]
    async fn test_topic_caches_are_shared() {
        let (log, factory, pointers) = setup(&["journal"]);
        log.append_action(
            "journal",
            0,
            "a",
            &JournalAction::Append {
                range: SeqRange::new(1, 1),
            },
        );
        let cache = HeadCache::new(HeadConfig::default(), factory.clone(), pointers).unwrap();

        cache.get("journal", "a", 0, 0).await.unwrap();
        cache.get("journal", "b", 0, 0).await.unwrap();

        // One consumer for the topic, no matter how many queries.
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_unknown_topic_propagates_discovery_failure() {
        let (_log, factory, pointers) = setup(&[]);
        let cache = HeadCache::new(HeadConfig::default(), factory, pointers).unwrap();

        let result = cache.get("missing", "a", 0, 0).await;
        assert!(matches!(
            result,
            Err(HeadError::PartitionDiscovery { .. })
        ));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_get_after_close_fails_closed() {
        let (_log, factory, pointers) = setup(&["journal"]);
        let cache = HeadCache::new(HeadConfig::default(), factory, pointers).unwrap();

        cache.get("journal", "a", 0, 0).await.unwrap();
        cache.close().await;

        let result = cache.get("journal", "a", 0, 0).await;
        assert!(matches!(result, Err(HeadError::Closed)));
    }

    #[tokio::test]
    async fn test_decorators_preserve_semantics() {
        let (log, factory, pointers) = setup(&["journal"]);
        log.append_action(
            "journal",
            0,
            "a",
            &JournalAction::Append {
                range: SeqRange::new(1, 3),
            },
        );
        let cache = HeadCache::new(HeadConfig::default(), factory, pointers).unwrap();
        let decorated = LoggedHeads::new(MeteredHeads::new(cache));

        // No durable pointer seeds the partition, so the first answers may
        // be Invalid until ingest catches up.
        let mut answer = decorated.get("journal", "a", 0, 0).await.unwrap();
        for _ in 0..200 {
            if matches!(answer, HeadResult::Valid(JournalInfo::NonEmpty(_))) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            answer = decorated.get("journal", "a", 0, 0).await.unwrap();
        }
        assert!(matches!(answer, HeadResult::Valid(JournalInfo::NonEmpty(_))));

        decorated.close().await;
        assert!(matches!(
            decorated.get("journal", "a", 0, 0).await,
            Err(HeadError::Closed)
        ));
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            classify(&Ok(HeadResult::Valid(JournalInfo::Empty))),
            GetOutcome::Replicated
        );
        assert_eq!(classify(&Ok(HeadResult::Invalid)), GetOutcome::Invalid);
        assert_eq!(classify(&Err(HeadError::Closed)), GetOutcome::Failure);
    }
}
