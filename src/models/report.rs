//! The outcome of a refresh run, as handed to the writers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ShardKey;
use crate::errors::RefreshError;

/// What happened to one shard during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ShardOutcome {
    /// Every record was fetched and the shard was stored.
    Updated,
    /// The fetch stopped early. The records gathered were stored, but the
    /// shard will be fetched again on the next run.
    Partial(String),
    /// Nothing was fetched; the stored shard is untouched.
    Failed(String),
    /// The shard was not attempted.
    Skipped(String),
}

impl ShardOutcome {
    /// Whether the shard holds new data.
    pub fn is_success(&self) -> bool {
        matches!(self, ShardOutcome::Updated | ShardOutcome::Partial(_))
    }
}

impl fmt::Display for ShardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardOutcome::Updated => write!(f, "updated"),
            ShardOutcome::Partial(reason) => write!(f, "partial ({})", reason),
            ShardOutcome::Failed(reason) => write!(f, "failed ({})", reason),
            ShardOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

/// The result of the refresh of one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub shard: ShardKey,
    pub outcome: ShardOutcome,
    /// The records received for this shard.
    pub fetched: usize,
    /// The records in the shard after the run.
    pub records: usize,
    /// The watermark stored for the shard, if it moved.
    pub watermark: Option<DateTime<Utc>>,
}

impl ShardReport {
    pub fn skipped(shard: ShardKey, reason: &str) -> Self {
        ShardReport {
            shard,
            outcome: ShardOutcome::Skipped(reason.to_string()),
            fetched: 0,
            records: 0,
            watermark: None,
        }
    }
}

/// The result of a whole refresh run.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    /// Example: nvd
    pub feed: String,
    pub directory: String,
    /// Example: nvdcve-
    pub prefix: String,
    pub started_at: DateTime<Utc>,
    pub interrupted: bool,
    pub shards: Vec<ShardReport>,
}

impl RefreshReport {
    pub fn new(feed: &str, directory: &str, prefix: &str, started_at: DateTime<Utc>) -> Self {
        RefreshReport {
            feed: feed.to_string(),
            directory: directory.to_string(),
            prefix: prefix.to_string(),
            started_at,
            interrupted: false,
            shards: Vec::new(),
        }
    }

    /// The number of year shards holding new data.
    pub fn succeeded(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| matches!(s.shard, ShardKey::Year(_)) && s.outcome.is_success())
            .count()
    }

    /// The verdict of the run: it fails only when no year shard got new data.
    pub fn result(&self) -> Result<(), RefreshError> {
        if self.succeeded() > 0 {
            Ok(())
        } else if self.interrupted {
            Err(RefreshError::Interrupted)
        } else {
            Err(RefreshError::AllShardsFailed)
        }
    }
}
