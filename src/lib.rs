#![forbid(unsafe_code)]
#![warn(missing_docs)]
//! # headstream
//!
//! A concurrent, bounded in-memory index over the *head* of a partitioned,
//! append-only journal, the trailing edge of the log not yet absorbed by
//! the durable store. Given `(topic, id, partition, offset)`, the cache
//! answers whether the journal is known to be empty, has pending entries,
//! or cannot be answered from memory, in which case callers fall back to
//! the durable store. It never lies: any doubt answers `Invalid`.
//!
//! The cache merges a live consumer stream with an eventual per-partition
//! replication pointer, bounds its memory with coarse per-partition
//! trimming, and parks queries that are ahead of ingest until the missing
//! records arrive.
//!
//! ```no_run
//! use std::sync::Arc;
//! use headstream::{
//!     HeadCache, HeadConfig, Heads, MemoryConsumerFactory, MemoryLog, MemoryPointers,
//! };
//!
//! # async fn demo() -> headstream::Result<()> {
//! let log = Arc::new(MemoryLog::new());
//! log.create_topic("journal", 4);
//!
//! let cache = HeadCache::new(
//!     HeadConfig::default(),
//!     Arc::new(MemoryConsumerFactory::new(log.clone())),
//!     Arc::new(MemoryPointers::new()),
//! )?;
//!
//! let answer = cache.get("journal", "account-42", 0, 17).await?;
//! println!("{answer:?}");
//! cache.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod pointers;
pub mod state;
pub mod topic;

pub use broker::{LogRecord, MemoryLog, SharedLog};
pub use cache::{HeadCache, Heads, LoggedHeads, MeteredHeads};
pub use config::HeadConfig;
pub use consumer::{
    AutoOffsetReset, ConsumerConfig, ConsumerFactory, LogConsumer, MemoryConsumer,
    MemoryConsumerFactory, Record,
};
pub use error::{HeadError, Result};
pub use journal::{JournalAction, JournalHead, JournalInfo, Offset, Partition, SeqNr, SeqRange};
pub use metrics::GetOutcome;
pub use pointers::{MemoryPointers, PointerSource};
pub use state::{CacheState, Entry, HeadResult, PartitionEntry};
pub use topic::TopicCache;
