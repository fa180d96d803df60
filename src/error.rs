//! Error types for headstream.
//!
//! Uses `thiserror` for ergonomic error definitions. The policy throughout
//! the crate is fail-open: a query that cannot be answered confidently is
//! answered `Invalid` rather than with a guess, and only lifecycle and
//! collaborator failures surface as errors.

use thiserror::Error;

/// Main error type for headstream operations.
#[derive(Error, Debug)]
pub enum HeadError {
    /// The log reported no partitions for a topic.
    #[error("no partitions found for topic '{0}'")]
    NoPartitions(String),

    /// Partition discovery kept failing after bounded retry.
    #[error("partition discovery failed for topic '{topic}' after {attempts} attempts: {reason}")]
    PartitionDiscovery {
        /// Topic whose partitions could not be resolved.
        topic: String,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Last failure observed.
        reason: String,
    },

    /// Underlying log consumer failure.
    #[error("consumer error: {0}")]
    Consumer(String),

    /// The eventual pointer source failed.
    #[error("pointer source error: {0}")]
    Pointers(String),

    /// Configuration validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A query arrived after the cache was closed.
    #[error("head cache is closed")]
    Closed,
}

/// Result type alias for headstream operations.
pub type Result<T> = std::result::Result<T, HeadError>;
