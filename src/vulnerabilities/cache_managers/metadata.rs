//! The `cache.properties` file kept next to the shards.
//!
//! It records the prefix and directory of the cache and, per shard, the
//! watermark of the last complete refresh. A shard without a watermark is
//! fully fetched on the next run.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, trace, warn};
use tempfile::NamedTempFile;

use crate::errors::CacheError;
use crate::models::ShardKey;

/// The name of the metadata file in the cache directory.
pub const METADATA_FILE: &str = "cache.properties";

const WATERMARK_KEY: &str = "lastModifiedDate";

/// The persisted `key=value` settings of a cache directory.
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    path: PathBuf,
    properties: BTreeMap<String, String>,
}

impl CacheMetadata {
    /// Reads the metadata of a cache directory. A missing file gives empty
    /// metadata, and malformed lines are skipped.
    pub fn load(directory: &Path) -> Result<Self, CacheError> {
        trace!("Running CacheMetadata::load()");
        let path = directory.join(METADATA_FILE);
        let mut properties = BTreeMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| CacheError::io(&path, e))?;
            for line in content.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match line.split_once('=') {
                    Some((key, value)) => {
                        properties.insert(key.trim().to_string(), value.trim().to_string());
                    }
                    None => warn!("Ignoring the malformed line {:?} in {}", line, path.display()),
                }
            }
            debug!("Read {} properties from {}", properties.len(), path.display());
        }
        Ok(CacheMetadata { path, properties })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    /// The watermark of a shard.
    /// Example key: lastModifiedDate.nvdcve-2021
    pub fn watermark(&self, prefix: &str, shard: ShardKey) -> Option<DateTime<Utc>> {
        self.parse_date(&format!("{}.{}{}", WATERMARK_KEY, prefix, shard))
    }

    pub fn set_watermark(&mut self, prefix: &str, shard: ShardKey, watermark: DateTime<Utc>) {
        let key = format!("{}.{}{}", WATERMARK_KEY, prefix, shard);
        self.set(&key, &format_date(&watermark));
    }

    /// The latest watermark over every shard of a feed.
    /// Example key: lastModifiedDate.nvdcve-
    pub fn feed_watermark(&self, prefix: &str) -> Option<DateTime<Utc>> {
        self.parse_date(&format!("{}.{}", WATERMARK_KEY, prefix))
    }

    pub fn set_feed_watermark(&mut self, prefix: &str, watermark: DateTime<Utc>) {
        let key = format!("{}.{}", WATERMARK_KEY, prefix);
        self.set(&key, &format_date(&watermark));
    }

    fn parse_date(&self, key: &str) -> Option<DateTime<Utc>> {
        let value = self.get(key)?;
        match DateTime::parse_from_rfc3339(value) {
            Ok(date) => Some(date.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring the invalid date {} of {}: {}", value, key, e);
                None
            }
        }
    }

    /// Writes the metadata, replacing the previous file atomically.
    pub fn save(&self) -> Result<(), CacheError> {
        trace!("Running CacheMetadata::save()");
        let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(directory).map_err(|e| CacheError::io(directory, e))?;
        for (key, value) in &self.properties {
            writeln!(temp, "{}={}", key, value).map_err(|e| CacheError::io(&self.path, e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| CacheError::io(&self.path, e))?;
        temp.persist(&self.path)
            .map_err(|e| CacheError::io(&self.path, e.error))?;
        debug!("Saved {}", self.path.display());
        Ok(())
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}
