//! In this module are declared the entities manipulated by this program
//!
//! The records themselves follow the upstream wire schemas and live in
//! [`cve`] and [`advisory`]. This module holds what the fetchers and the
//! cache need to treat them uniformly.

pub mod advisory;
pub mod cve;
pub mod report;

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};

/// The earliest year the upstream feeds support. Records published before it
/// are folded into this year's shard.
pub const FIRST_YEAR: i32 = 2002;

/// A vulnerability record as fetched from an upstream feed.
///
/// Records are identified by [`Record::id`]; a later copy of a record fully
/// replaces an earlier one.
pub trait Record: Serialize + DeserializeOwned + Clone + fmt::Debug {
    /// The `format` written in the cache envelope.
    const FORMAT: &'static str;
    /// The `version` written in the cache envelope.
    const VERSION: &'static str;

    /// The unique identifier of the record.
    fn id(&self) -> &str;

    /// When the record was published.
    fn published(&self) -> DateTime<Utc>;

    /// When the record was last modified.
    fn last_modified(&self) -> DateTime<Utc>;

    /// The year shard this record belongs to.
    fn shard_key(&self) -> ShardKey {
        ShardKey::Year(self.published().year().max(FIRST_YEAR))
    }
}

/// The name of a cache partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardKey {
    /// All the records published during a year.
    Year(i32),
    /// The records modified during the last days, across every year.
    Modified,
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Year(year) => write!(f, "{}", year),
            ShardKey::Modified => write!(f, "modified"),
        }
    }
}

impl Serialize for ShardKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One batch of records returned by a single upstream call.
#[derive(Debug, Clone)]
pub struct Page<R> {
    /// The records, in upstream order. Ids are not guaranteed unique.
    pub records: Vec<R>,
    /// The HTTP status of the call that produced the page.
    pub status: u16,
    /// Where the next page starts, `None` when the upstream is exhausted.
    pub next_cursor: Option<String>,
    /// The number of records the upstream claims to match the filter.
    pub total_claimed: u64,
}

/// Returns the latest of two optional timestamps.
pub fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::cve_item;

    #[test]
    fn old_records_fold_into_the_first_year() {
        let item = cve_item("CVE-1999-0001", "1999-12-30T05:00:00.000", "2010-12-30T05:00:00.000");
        assert_eq!(ShardKey::Year(FIRST_YEAR), item.shard_key());

        let item = cve_item("CVE-2015-0001", "2015-03-01T05:00:00.000", "2020-01-01T00:00:00.000");
        assert_eq!(ShardKey::Year(2015), item.shard_key());
    }

    #[test]
    fn shard_keys_display_as_file_stems() {
        assert_eq!("2021", ShardKey::Year(2021).to_string());
        assert_eq!("modified", ShardKey::Modified.to_string());
        assert!(ShardKey::Year(2030) < ShardKey::Modified);
    }

    #[test]
    fn latest_keeps_the_maximum() {
        let a = "2020-01-01T00:00:00Z".parse::<DateTime<Utc>>().ok();
        let b = "2021-01-01T00:00:00Z".parse::<DateTime<Utc>>().ok();
        assert_eq!(b, latest(a, b));
        assert_eq!(a, latest(a, None));
        assert_eq!(b, latest(None, b));
        assert_eq!(None, latest(None, None));
    }
}
