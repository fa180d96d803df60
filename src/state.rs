#![forbid(unsafe_code)]
//! Per-topic cache state: partition entry maps, merge/trim, cleanup, and
//! pending listeners.
//!
//! All mutation happens under the owning topic cache's write lock; the
//! methods here are synchronous and never block. The query decision table
//! lives in [`resolve`] so that direct queries and listener sweeps cannot
//! diverge.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::consumer::Record;
use crate::journal::{JournalAction, JournalHead, JournalInfo, Offset, Partition};

/// Answer to a head query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadResult {
    /// The cache cannot answer; ask the durable store.
    Invalid,
    /// The cache knows the journal head.
    Valid(JournalInfo),
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Cached head summary for one aggregate within a partition.
///
/// `offset` is the largest log offset among the `Append`/`Delete` actions
/// folded into `head`; marks never advance it. The summary is always
/// non-empty; aggregates that fold to empty are simply not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Aggregate id.
    pub id: String,
    /// Largest offset folded into the summary.
    pub offset: Offset,
    /// The non-empty head summary.
    pub head: JournalHead,
}

impl Entry {
    /// Combine two entries for the same aggregate: max offset, combined head.
    pub fn combine(self, other: Entry) -> Entry {
        Entry {
            id: self.id,
            offset: self.offset.max(other.offset),
            head: self.head.combine(other.head),
        }
    }
}

/// Cached state of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Partition id.
    pub partition: Partition,
    /// Max log offset observed for this partition, any action type.
    pub offset: Offset,
    /// Per-aggregate entries.
    pub entries: HashMap<String, Entry>,
    /// Offset up to which entries were evicted under memory pressure.
    /// While set, absence of an entry proves nothing.
    pub trimmed: Option<Offset>,
}

impl PartitionEntry {
    /// An entry-less partition seeded at the durable pointer.
    pub fn seeded(partition: Partition, offset: Offset) -> Self {
        Self {
            partition,
            offset,
            entries: HashMap::new(),
            trimmed: None,
        }
    }

    /// Fold one poll batch into a candidate partition entry.
    ///
    /// Records must belong to `partition` and arrive in log order. Returns
    /// `None` for an empty batch.
    pub fn of(partition: Partition, records: &[Record]) -> Option<Self> {
        if records.is_empty() {
            return None;
        }

        let mut offset: Offset = 0;
        let mut folds: HashMap<&str, (JournalInfo, Option<Offset>)> = HashMap::new();

        for record in records {
            offset = offset.max(record.offset);
            let fold = folds
                .entry(record.id.as_str())
                .or_insert((JournalInfo::Empty, None));
            fold.0 = fold.0.apply(&record.action);
            if !matches!(record.action, JournalAction::Mark { .. }) {
                fold.1 = Some(fold.1.map_or(record.offset, |o| o.max(record.offset)));
            }
        }

        let entries = folds
            .into_iter()
            .filter_map(|(id, (info, entry_offset))| {
                let head = info.head()?;
                Some((
                    id.to_string(),
                    Entry {
                        id: id.to_string(),
                        offset: entry_offset?,
                        head,
                    },
                ))
            })
            .collect();

        Some(Self {
            partition,
            offset,
            entries,
            trimmed: None,
        })
    }

    /// Combine two states of the same partition.
    pub fn combine(mut self, other: PartitionEntry) -> PartitionEntry {
        for (id, entry) in other.entries {
            match self.entries.remove(&id) {
                Some(existing) => {
                    self.entries.insert(id, existing.combine(entry));
                }
                None => {
                    self.entries.insert(id, entry);
                }
            }
        }
        PartitionEntry {
            partition: self.partition,
            offset: self.offset.max(other.offset),
            entries: self.entries,
            trimmed: match (self.trimmed, other.trimmed) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Decision table
// ---------------------------------------------------------------------------

/// Resolve a query against a snapshot of the partition entries.
///
/// Returns `None` when the cache has not yet observed `offset` for the
/// partition, in which case the caller is behind the ingest and must wait.
pub fn resolve(
    entries: &HashMap<Partition, PartitionEntry>,
    id: &str,
    partition: Partition,
    offset: Offset,
) -> Option<HeadResult> {
    let partition_entry = match entries.get(&partition) {
        Some(entry) => entry,
        None => return Some(HeadResult::Invalid),
    };
    if partition_entry.offset < offset {
        return None;
    }
    match partition_entry.entries.get(id) {
        Some(entry) => Some(HeadResult::Valid(JournalInfo::NonEmpty(entry.head))),
        None if partition_entry.trimmed.is_none() => Some(HeadResult::Valid(JournalInfo::Empty)),
        None => Some(HeadResult::Invalid),
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A pending query waiting for the cache to observe enough records.
#[derive(Debug)]
pub struct Listener {
    id: String,
    partition: Partition,
    offset: Offset,
    tx: oneshot::Sender<HeadResult>,
}

impl Listener {
    /// Register interest in `(id, partition, offset)`; the returned receiver
    /// completes with the first non-behind answer.
    pub fn new(id: String, partition: Partition, offset: Offset) -> (Self, oneshot::Receiver<HeadResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id,
                partition,
                offset,
                tx,
            },
            rx,
        )
    }

    /// Whether the waiting query has gone away (cancelled or timed out).
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Complete the listener. Completion consumes the listener, so it can
    /// fire at most once; a receiver that is already gone is ignored.
    pub fn complete(self, result: HeadResult) {
        let _ = self.tx.send(result);
    }
}

// ---------------------------------------------------------------------------
// Per-topic state
// ---------------------------------------------------------------------------

/// Mutable state of one topic cache.
#[derive(Debug, Default)]
pub struct CacheState {
    /// Per-partition entry maps.
    pub entries: HashMap<Partition, PartitionEntry>,
    /// Pending listeners, swept on every state update.
    pub listeners: Vec<Listener>,
}

impl CacheState {
    /// Seed the state with one empty partition entry per durable pointer.
    pub fn seeded(pointers: &HashMap<Partition, Offset>) -> Self {
        Self {
            entries: pointers
                .iter()
                .map(|(&partition, &offset)| {
                    (partition, PartitionEntry::seeded(partition, offset))
                })
                .collect(),
            listeners: Vec::new(),
        }
    }

    /// Total entry count across partitions.
    pub fn total_entries(&self) -> usize {
        self.entries.values().map(|p| p.entries.len()).sum()
    }

    /// Merge a poll batch into the state, trimming when the total entry
    /// count would exceed `max_size`.
    ///
    /// Trimming is coarse: any partition over its share is emptied wholesale
    /// and its `trimmed` watermark set to the max evicted entry offset. The
    /// cache must never silently lie about absence, so queries at or below
    /// that watermark answer `Invalid` until cleanup passes it.
    pub fn combine_and_trim(
        &mut self,
        batch: HashMap<Partition, PartitionEntry>,
        max_size: usize,
    ) {
        for (partition, candidate) in batch {
            let merged = match self.entries.remove(&partition) {
                Some(existing) => existing.combine(candidate),
                None => candidate,
            };
            self.entries.insert(partition, merged);
        }

        if self.total_entries() <= max_size {
            return;
        }

        let per_partition_cap = (max_size / self.entries.len().max(1)).max(1);
        for partition_entry in self.entries.values_mut() {
            if partition_entry.entries.len() <= per_partition_cap {
                continue;
            }
            let evicted_max = partition_entry
                .entries
                .values()
                .map(|e| e.offset)
                .max()
                .unwrap_or(partition_entry.offset);
            partition_entry.entries.clear();
            partition_entry.trimmed = Some(
                partition_entry
                    .trimmed
                    .map_or(evicted_max, |t| t.max(evicted_max)),
            );
        }
    }

    /// Drop entries at or below the durable pointers and clear `trimmed`
    /// watermarks the pointers have passed. Returns the number of entries
    /// removed. Partitions absent from `pointers` are left untouched.
    pub fn remove_until(&mut self, pointers: &HashMap<Partition, Offset>) -> usize {
        let mut removed = 0;
        for (partition, &pointer) in pointers {
            if let Some(partition_entry) = self.entries.get_mut(partition) {
                let before = partition_entry.entries.len();
                partition_entry.entries.retain(|_, entry| entry.offset > pointer);
                removed += before - partition_entry.entries.len();
                if partition_entry.trimmed.is_some_and(|t| t <= pointer) {
                    partition_entry.trimmed = None;
                }
            }
        }
        removed
    }

    /// Re-run the decision table for every pending listener.
    ///
    /// Satisfied listeners are removed and returned with their answers so
    /// the caller can complete them after the state change commits;
    /// abandoned listeners are purged.
    pub fn sweep_listeners(&mut self) -> Vec<(Listener, HeadResult)> {
        let pending = std::mem::take(&mut self.listeners);
        let mut satisfied = Vec::new();
        for listener in pending {
            if listener.is_abandoned() {
                continue;
            }
            match resolve(&self.entries, &listener.id, listener.partition, listener.offset) {
                Some(result) => satisfied.push((listener, result)),
                None => self.listeners.push(listener),
            }
        }
        satisfied
    }

    /// Fail every pending listener, e.g. when the topic cache is torn down
    /// or poisoned. Waiters see `Invalid` rather than hanging forever.
    pub fn fail_listeners(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.complete(HeadResult::Invalid);
        }
    }
}
