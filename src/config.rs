#![forbid(unsafe_code)]
//! Head cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;
use crate::error::{HeadError, Result};

/// Configuration for the head cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Maximum wait inside one ingest poll.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    /// Period between cleanup cycles.
    #[serde(default = "default_clean_interval")]
    pub clean_interval: Duration,
    /// Upper bound on total entry count across partitions, per topic.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Configuration passed through to the log consumer. The group,
    /// offset-reset and auto-commit fields are overridden at construction.
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(10)
}
fn default_clean_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_max_size() -> usize {
    100_000
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            poll_timeout: default_poll_timeout(),
            clean_interval: default_clean_interval(),
            max_size: default_max_size(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl HeadConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(HeadError::Config(
                "max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
