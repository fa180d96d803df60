#![forbid(unsafe_code)]
//! Eventual pointer source.
//!
//! Supplies, per partition, the offset up to and including which the durable
//! store has absorbed the journal for a topic. The value is a monotone
//! non-decreasing approximation and need not be causally consistent with the
//! live consumer stream; absence of a partition means nothing durable yet.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::journal::{Offset, Partition};

/// Read access to the durable store's per-partition replication pointers.
#[async_trait]
pub trait PointerSource: Send + Sync {
    /// Offsets up to which the journal has been durably persisted, keyed by
    /// partition. Partitions with nothing durable yet are absent.
    async fn pointers(&self, topic: &str) -> Result<HashMap<Partition, Offset>>;
}

/// In-memory pointer source for tests and demos.
///
/// Pointers are advanced explicitly with [`MemoryPointers::set`], standing in
/// for the replicator that trails the live stream.
#[derive(Debug, Default)]
pub struct MemoryPointers {
    pointers: RwLock<HashMap<String, HashMap<Partition, Offset>>>,
}

impl MemoryPointers {
    /// Create an empty pointer source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the durable pointer of one partition.
    pub fn set(&self, topic: &str, partition: Partition, offset: Offset) {
        let mut pointers = self.pointers.write();
        pointers
            .entry(topic.to_string())
            .or_default()
            .insert(partition, offset);
    }
}

#[async_trait]
impl PointerSource for MemoryPointers {
    async fn pointers(&self, topic: &str) -> Result<HashMap<Partition, Offset>> {
        Ok(self
            .pointers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default())
    }
}
