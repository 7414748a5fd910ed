//! The module cache_managers defines the vulnerabilities cache managers.
//!
//! The cache is split in [`Shard`]s, one per publication year plus one for
//! the recently modified records. A shard is always rewritten as a whole.

pub mod files;
pub mod metadata;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CacheError;
use crate::models::cve::nvd_timestamp;
use crate::models::{Record, ShardKey};

/// The records of one cache partition, keyed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard<R> {
    pub key: ShardKey,
    pub records: BTreeMap<String, R>,
    /// The latest modification incorporated in the shard.
    pub watermark: DateTime<Utc>,
}

impl<R: Record> Shard<R> {
    /// Creates a shard holding no record.
    pub fn empty(key: ShardKey, watermark: DateTime<Utc>) -> Self {
        Shard {
            key,
            records: BTreeMap::new(),
            watermark,
        }
    }

    /// Creates a shard from a list of records. A later copy of an id
    /// replaces an earlier one.
    pub fn from_records(key: ShardKey, records: impl IntoIterator<Item = R>, watermark: DateTime<Utc>) -> Self {
        let mut shard = Self::empty(key, watermark);
        shard.merge(records);
        shard
    }

    /// Merges freshly fetched records into the shard.
    ///
    /// A fetched record always replaces the cached record with the same id.
    /// Cached records absent from the fetch are kept unchanged.
    pub fn merge(&mut self, fetched: impl IntoIterator<Item = R>) {
        for record in fetched {
            self.records.insert(record.id().to_string(), record);
        }
    }

    /// The latest modification of the records of the shard.
    pub fn max_last_modified(&self) -> Option<DateTime<Utc>> {
        self.records.values().map(|r| r.last_modified()).max()
    }

    /// Sets the watermark to the latest modification of the records, or to
    /// `fallback` when there is no record.
    pub fn refresh_watermark(&mut self, fallback: DateTime<Utc>) {
        self.watermark = self.max_last_modified().unwrap_or(fallback);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The document stored in a cache artifact. The fields mirror the envelope
/// of the NVD API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEnvelope<R> {
    #[serde(rename = "resultsPerPage")]
    pub results_per_page: u64,
    #[serde(rename = "startIndex")]
    pub start_index: u64,
    #[serde(rename = "totalResults")]
    pub total_results: u64,
    pub format: String,
    pub version: String,
    #[serde(with = "nvd_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub vulnerabilities: Vec<R>,
}

impl<R: Record> CacheEnvelope<R> {
    /// Wraps the records of a shard, sorted by id.
    pub fn from_shard(shard: &Shard<R>) -> Self {
        let count = shard.len() as u64;
        CacheEnvelope {
            results_per_page: count,
            start_index: 0,
            total_results: count,
            format: R::FORMAT.to_string(),
            version: R::VERSION.to_string(),
            timestamp: shard.watermark,
            vulnerabilities: shard.records.values().cloned().collect(),
        }
    }
}

/// The content of a sidecar file.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardDigest {
    pub last_modified: DateTime<Utc>,
    /// The size of the uncompressed JSON document.
    pub size: u64,
    /// The size of the artifact on disk.
    pub gz_size: u64,
    /// The hex encoded SHA-256 of the uncompressed JSON document.
    pub sha256: String,
}

/// A common interface between all cache managers.
pub trait CacheManager<R: Record> {
    /// Reads a shard. Returns `None` when it was never stored.
    fn load(&self, key: ShardKey) -> Result<Option<Shard<R>>, CacheError>;

    /// Replaces the stored shard. Readers see either the previous shard or
    /// the new one, never a mix.
    fn store(&self, shard: &Shard<R>) -> Result<ShardDigest, CacheError>;

    /// Reads the sidecar of a shard.
    fn read_meta(&self, key: ShardKey) -> Result<Option<ShardDigest>, CacheError>;
}
