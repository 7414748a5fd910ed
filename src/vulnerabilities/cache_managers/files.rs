//! This module contains the ShardedCache struct.
//!
//! The cache has the following structure:
//! <directory>/
//!   |__<prefix><shard>.json.gz
//!   |__<prefix><shard>.meta
//!   |__cache.properties
//!
//! The artifact is a gzipped [`CacheEnvelope`]. The sidecar holds
//! `key:value` lines describing it.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, trace};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{CacheEnvelope, CacheManager, Shard, ShardDigest};
use crate::errors::CacheError;
use crate::models::{Record, ShardKey};

/// Counts and hashes the bytes written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Returns the inner writer, the hex digest and the byte count.
    fn finish(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.count)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Represents a cache manager which stores each shard in a gzipped file.
pub struct ShardedCache<R> {
    directory: PathBuf,
    prefix: String,
    records: PhantomData<fn() -> R>,
}

impl<R: Record> ShardedCache<R> {
    /// Opens the cache, creating the directory if needed.
    pub fn new(directory: &Path, prefix: &str) -> Result<Self, CacheError> {
        trace!("Running ShardedCache::new()");
        fs::create_dir_all(directory).map_err(|e| CacheError::io(directory, e))?;
        Ok(ShardedCache {
            directory: directory.to_path_buf(),
            prefix: prefix.to_string(),
            records: PhantomData,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Example: /var/cache/nvd/nvdcve-2021.json.gz
    pub fn artifact_path(&self, key: ShardKey) -> PathBuf {
        self.directory.join(format!("{}{}.json.gz", self.prefix, key))
    }

    /// Example: /var/cache/nvd/nvdcve-2021.meta
    pub fn meta_path(&self, key: ShardKey) -> PathBuf {
        self.directory.join(format!("{}{}.meta", self.prefix, key))
    }

    /// Writes the gzipped envelope to a temporary file in the cache
    /// directory. Nothing is visible at `path` until the file is persisted.
    fn write_artifact(&self, shard: &Shard<R>, path: &Path) -> Result<(NamedTempFile, String, u64), CacheError> {
        let mut temp = NamedTempFile::new_in(&self.directory).map_err(|e| CacheError::io(&self.directory, e))?;
        let (digest, size) = {
            let encoder = GzEncoder::new(BufWriter::new(temp.as_file_mut()), Compression::default());
            let mut writer = HashingWriter::new(encoder);
            serde_json::to_writer(&mut writer, &CacheEnvelope::from_shard(shard)).map_err(|e| {
                CacheError::Format {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;
            let (encoder, digest, size) = writer.finish();
            let mut buffered = encoder.finish().map_err(|e| CacheError::io(path, e))?;
            buffered.flush().map_err(|e| CacheError::io(path, e))?;
            (digest, size)
        };
        temp.as_file().sync_all().map_err(|e| CacheError::io(path, e))?;
        Ok((temp, digest, size))
    }

    /// Writes the sidecar to a temporary file, persisted by the caller.
    fn write_meta(&self, digest: &ShardDigest, path: &Path) -> Result<NamedTempFile, CacheError> {
        let mut temp = NamedTempFile::new_in(&self.directory).map_err(|e| CacheError::io(&self.directory, e))?;
        write!(
            temp,
            "lastModifiedDate:{}\nsize:{}\ngzSize:{}\nsha256:{}\n",
            digest.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            digest.size,
            digest.gz_size,
            digest.sha256
        )
        .map_err(|e| CacheError::io(path, e))?;
        temp.as_file().sync_all().map_err(|e| CacheError::io(path, e))?;
        Ok(temp)
    }
}

/// Parses the `key:value` lines of a sidecar.
fn parse_meta(path: &Path, content: &str) -> Result<ShardDigest, CacheError> {
    let malformed = |line: &str| CacheError::Metadata {
        path: path.to_path_buf(),
        line: line.to_string(),
    };
    let mut last_modified = None;
    let mut size = None;
    let mut gz_size = None;
    let mut sha256 = None;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(':').ok_or_else(|| malformed(line))?;
        match key {
            "lastModifiedDate" => {
                let date = DateTime::parse_from_rfc3339(value).map_err(|_| malformed(line))?;
                last_modified = Some(date.with_timezone(&Utc));
            }
            "size" => size = Some(value.parse::<u64>().map_err(|_| malformed(line))?),
            "gzSize" => gz_size = Some(value.parse::<u64>().map_err(|_| malformed(line))?),
            "sha256" => sha256 = Some(value.to_string()),
            _ => debug!("Ignoring the key {} in {}", key, path.display()),
        }
    }

    match (last_modified, size, gz_size, sha256) {
        (Some(last_modified), Some(size), Some(gz_size), Some(sha256)) => Ok(ShardDigest {
            last_modified,
            size,
            gz_size,
            sha256,
        }),
        _ => Err(malformed("<missing keys>")),
    }
}

impl<R: Record> CacheManager<R> for ShardedCache<R> {
    fn load(&self, key: ShardKey) -> Result<Option<Shard<R>>, CacheError> {
        trace!("Running ShardedCache::load({})", key);
        let path = self.artifact_path(key);
        if !path.exists() {
            debug!("No cached shard at {}", path.display());
            return Ok(None);
        }

        let file = File::open(&path).map_err(|e| CacheError::io(&path, e))?;
        let envelope: CacheEnvelope<R> = serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
            .map_err(|e| {
                if e.is_io() {
                    CacheError::io(&path, e.into())
                } else {
                    CacheError::Format {
                        path: path.clone(),
                        source: e,
                    }
                }
            })?;

        let watermark = match self.read_meta(key)? {
            Some(meta) => meta.last_modified,
            None => envelope.timestamp,
        };
        debug!(
            "Loaded {} records from {}",
            envelope.vulnerabilities.len(),
            path.display()
        );
        Ok(Some(Shard::from_records(
            key,
            envelope.vulnerabilities,
            watermark,
        )))
    }

    fn store(&self, shard: &Shard<R>) -> Result<ShardDigest, CacheError> {
        trace!("Running ShardedCache::store({})", shard.key);
        let artifact = self.artifact_path(shard.key);
        let meta = self.meta_path(shard.key);

        let (temp, sha256, size) = self.write_artifact(shard, &artifact)?;
        let gz_size = temp
            .as_file()
            .metadata()
            .map_err(|e| CacheError::io(&artifact, e))?
            .len();
        let digest = ShardDigest {
            last_modified: shard.watermark,
            size,
            gz_size,
            sha256,
        };
        let meta_temp = self.write_meta(&digest, &meta)?;

        // Both files are complete before either is renamed into place.
        temp.persist(&artifact)
            .map_err(|e| CacheError::io(&artifact, e.error))?;
        meta_temp
            .persist(&meta)
            .map_err(|e| CacheError::io(&meta, e.error))?;
        debug!(
            "Stored {} records in {} ({} bytes, {} compressed)",
            shard.len(),
            artifact.display(),
            size,
            gz_size
        );
        Ok(digest)
    }

    fn read_meta(&self, key: ShardKey) -> Result<Option<ShardDigest>, CacheError> {
        let path = self.meta_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| CacheError::io(&path, e))?;
        parse_meta(&path, &content).map(Some)
    }
}
