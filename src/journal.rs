#![forbid(unsafe_code)]
//! Journal domain model: actions, sequence ranges, and head summaries.
//!
//! A journal is an append-only stream of actions per aggregate. The cache
//! never stores the actions themselves; it folds them into a [`JournalInfo`]
//! summary that is enough to answer "is this aggregate's journal empty, and
//! if not, how far does it reach".

use serde::{Deserialize, Serialize};

/// Per-aggregate sequence number carried inside journal actions.
///
/// Unrelated to log offsets: sequence numbers are dense per aggregate,
/// offsets are dense per partition.
pub type SeqNr = u64;

/// Position within a partition of the underlying log.
pub type Offset = u64;

/// Partition id within a topic.
pub type Partition = u32;

/// Inclusive range `[from, to]` of per-aggregate sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    /// First sequence number in the range.
    pub from: SeqNr,
    /// Last sequence number in the range (`from <= to`).
    pub to: SeqNr,
}

impl SeqRange {
    /// Create a range, normalising the bounds so `from <= to` holds.
    pub fn new(from: SeqNr, to: SeqNr) -> Self {
        if from <= to {
            Self { from, to }
        } else {
            Self { from: to, to: from }
        }
    }

    /// A single-element range.
    pub fn single(seq_nr: SeqNr) -> Self {
        Self {
            from: seq_nr,
            to: seq_nr,
        }
    }
}

/// An action recorded in the journal for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalAction {
    /// Events were appended covering the given sequence range.
    Append {
        /// Sequence numbers covered by the appended events.
        range: SeqRange,
    },
    /// Events up to and including `up_to` were deleted.
    Delete {
        /// Highest deleted sequence number.
        up_to: SeqNr,
    },
    /// A marker record used for read-your-writes probes; carries no
    /// journal data and never advances an aggregate's entry offset.
    Mark {
        /// Caller-supplied marker id.
        id: String,
    },
}

/// Summary of a non-empty journal head.
///
/// `delete_to` is always `<= seq_nr`; a delete reaching `seq_nr` collapses
/// the whole info to [`JournalInfo::Empty`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalHead {
    /// Largest appended sequence number observed.
    pub seq_nr: SeqNr,
    /// Highest deleted sequence number, when any delete was observed.
    pub delete_to: Option<SeqNr>,
}

impl JournalHead {
    /// Combine two heads field-wise by maximum.
    pub fn combine(self, other: JournalHead) -> JournalHead {
        JournalHead {
            seq_nr: self.seq_nr.max(other.seq_nr),
            delete_to: match (self.delete_to, other.delete_to) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// What is currently known about an aggregate's journal head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalInfo {
    /// No append observed, or every observed append was fully covered by a
    /// later delete.
    Empty,
    /// At least one append survives.
    NonEmpty(JournalHead),
}

impl JournalInfo {
    /// Fold one action into the summary.
    pub fn apply(self, action: &JournalAction) -> JournalInfo {
        match action {
            JournalAction::Append { range } => match self {
                JournalInfo::Empty => JournalInfo::NonEmpty(JournalHead {
                    seq_nr: range.to,
                    delete_to: None,
                }),
                JournalInfo::NonEmpty(head) => JournalInfo::NonEmpty(JournalHead {
                    seq_nr: head.seq_nr.max(range.to),
                    delete_to: head.delete_to,
                }),
            },
            JournalAction::Delete { up_to } => match self {
                JournalInfo::Empty => JournalInfo::Empty,
                JournalInfo::NonEmpty(head) => {
                    if *up_to >= head.seq_nr {
                        JournalInfo::Empty
                    } else {
                        JournalInfo::NonEmpty(JournalHead {
                            seq_nr: head.seq_nr,
                            delete_to: Some(head.delete_to.map_or(*up_to, |d| d.max(*up_to))),
                        })
                    }
                }
            },
            JournalAction::Mark { .. } => self,
        }
    }

    /// Combine two summaries; `Empty` is the identity, `NonEmpty` values
    /// combine field-wise by maximum.
    pub fn combine(self, other: JournalInfo) -> JournalInfo {
        match (self, other) {
            (JournalInfo::Empty, info) | (info, JournalInfo::Empty) => info,
            (JournalInfo::NonEmpty(a), JournalInfo::NonEmpty(b)) => {
                JournalInfo::NonEmpty(a.combine(b))
            }
        }
    }

    /// Fold a sequence of actions starting from `Empty`.
    pub fn of<'a>(actions: impl IntoIterator<Item = &'a JournalAction>) -> JournalInfo {
        actions
            .into_iter()
            .fold(JournalInfo::Empty, |info, action| info.apply(action))
    }

    /// The head summary, when non-empty.
    pub fn head(&self) -> Option<JournalHead> {
        match self {
            JournalInfo::Empty => None,
            JournalInfo::NonEmpty(head) => Some(*head),
        }
    }
}
