//! Refreshes a sharded cache from an upstream feed.
//!
//! Year shards are processed one after the other, oldest first, then the
//! "modified" shard is rebuilt from what the year shards hold. A shard whose
//! fetch fails is reported and the run goes on with the next one.
//!
//! Only one run may work on a cache directory at a time. Nothing here
//! prevents two processes from doing so: callers must ensure it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use log::{debug, error, info, trace, warn};

use crate::errors::{CacheError, FetchError, RefreshError};
use crate::models::advisory::SecurityAdvisory;
use crate::models::cve::CveItem;
use crate::models::report::{RefreshReport, ShardOutcome, ShardReport};
use crate::models::{latest, Record, ShardKey, FIRST_YEAR};
use crate::readers::http::HttpTransport;
use crate::vulnerabilities::cache_managers::files::ShardedCache;
use crate::vulnerabilities::cache_managers::metadata::CacheMetadata;
use crate::vulnerabilities::cache_managers::{CacheManager, Shard};
use crate::vulnerabilities::fetchers::ghsa::{AdvisoryQuery, GraphQlAdvisorySource};
use crate::vulnerabilities::fetchers::nvd::NvdQuery;
use crate::vulnerabilities::fetchers::windowed::WindowedRecordSource;
use crate::vulnerabilities::fetchers::PaginatedSource;
use crate::vulnerabilities::rate_limiter::RateLimiter;
use crate::vulnerabilities::shutdown::ShutdownSignal;

/// The records modified within this many days go to the "modified" shard.
pub const MODIFIED_WINDOW_DAYS: i64 = 7;

/// The NVD refuses last modified ranges over 120 days.
pub const NVD_MAX_LOOKBACK_DAYS: i64 = 120;

/// The oldest publication year found in the NVD. Everything published
/// before [`FIRST_YEAR`] belongs to the first shard.
pub const NVD_EARLIEST_PUBLISHED_YEAR: i32 = 1988;

/// An upstream feed split in year shards.
pub trait ShardFeed<R: Record> {
    /// Example: nvd
    fn name(&self) -> &str;

    /// How old a watermark may be for an incremental fetch. `None` when
    /// the upstream has no limit.
    fn max_lookback(&self) -> Option<Duration>;

    /// Opens a source returning the records of a year shard, only the ones
    /// modified since `modified_since` when set. The earliest shard also
    /// receives the records published before its year.
    fn open(
        &self,
        year: i32,
        modified_since: Option<DateTime<Utc>>,
        is_earliest: bool,
    ) -> Box<dyn PaginatedSource<R>>;
}

/// The CVEs of the NVD, fetched year by year in date windows.
pub struct NvdFeed {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
    query: NvdQuery,
    now: DateTime<Utc>,
}

impl NvdFeed {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownSignal,
        query: NvdQuery,
    ) -> Self {
        NvdFeed {
            transport,
            limiter,
            shutdown,
            query,
            now: Utc::now(),
        }
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

impl ShardFeed<CveItem> for NvdFeed {
    fn name(&self) -> &str {
        "nvd"
    }

    fn max_lookback(&self) -> Option<Duration> {
        Some(Duration::days(NVD_MAX_LOOKBACK_DAYS))
    }

    fn open(
        &self,
        year: i32,
        modified_since: Option<DateTime<Utc>>,
        is_earliest: bool,
    ) -> Box<dyn PaginatedSource<CveItem>> {
        let first = if is_earliest {
            NVD_EARLIEST_PUBLISHED_YEAR.min(year)
        } else {
            year
        };
        Box::new(
            WindowedRecordSource::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.limiter),
                self.shutdown.clone(),
                self.query.clone(),
                first..=year,
            )
            .with_modified_since(modified_since)
            .with_now(self.now),
        )
    }
}

/// The GitHub security advisories, fetched year by year.
pub struct GhsaFeed {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
    query: AdvisoryQuery,
}

impl GhsaFeed {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownSignal,
        query: AdvisoryQuery,
    ) -> Self {
        GhsaFeed {
            transport,
            limiter,
            shutdown,
            query,
        }
    }
}

impl ShardFeed<SecurityAdvisory> for GhsaFeed {
    fn name(&self) -> &str {
        "ghsa"
    }

    fn max_lookback(&self) -> Option<Duration> {
        None
    }

    fn open(
        &self,
        year: i32,
        modified_since: Option<DateTime<Utc>>,
        is_earliest: bool,
    ) -> Box<dyn PaginatedSource<SecurityAdvisory>> {
        let published_since = if is_earliest { None } else { year_start(year) };
        let published_until = year_start(year + 1).map(|d| d - Duration::milliseconds(1));
        let query = self
            .query
            .clone()
            .with_published_since(published_since)
            .with_published_until(published_until)
            .with_updated_since(modified_since);
        Box::new(GraphQlAdvisorySource::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.limiter),
            self.shutdown.clone(),
            query,
        ))
    }
}

fn year_start(year: i32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, 1, 1).map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Receives the progress of the fetches.
pub trait ProgressReporter {
    /// Called after each page. `loaded` counts the records received so far
    /// for the shard, `claimed` is the total announced by the upstream.
    fn page_loaded(&self, feed: &str, shard: ShardKey, loaded: u64, claimed: u64);
}

/// Logs the progress.
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn page_loaded(&self, feed: &str, shard: ShardKey, loaded: u64, claimed: u64) {
        debug!("{} {}: {}/{} records loaded", feed, shard, loaded, claimed);
    }
}

/// What the refresh of a year shard leaves behind.
struct ShardRun<R> {
    report: ShardReport,
    /// The content of the shard after the run, stored or not.
    content: Option<Shard<R>>,
    interrupted: bool,
}

/// Drives the refresh of every shard of a feed.
pub struct IncrementalOrchestrator<R: Record> {
    feed: Box<dyn ShardFeed<R>>,
    cache: ShardedCache<R>,
    metadata: CacheMetadata,
    shutdown: ShutdownSignal,
    reporter: Box<dyn ProgressReporter>,
    years: Option<(i32, i32)>,
    now: DateTime<Utc>,
}

impl<R: Record> IncrementalOrchestrator<R> {
    pub fn new(
        feed: Box<dyn ShardFeed<R>>,
        cache: ShardedCache<R>,
        metadata: CacheMetadata,
        shutdown: ShutdownSignal,
    ) -> Self {
        IncrementalOrchestrator {
            feed,
            cache,
            metadata,
            shutdown,
            reporter: Box::new(LogReporter),
            years: None,
            now: Utc::now(),
        }
    }

    /// Only refreshes the year shards between `start` and `end`, included.
    /// The other year shards still feed the "modified" shard.
    pub fn with_years(mut self, start: Option<i32>, end: Option<i32>) -> Self {
        if start.is_some() || end.is_some() {
            self.years = Some((start.unwrap_or(FIRST_YEAR), end.unwrap_or(i32::MAX)));
        }
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Overrides the processing time.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn metadata(&self) -> &CacheMetadata {
        &self.metadata
    }

    fn in_range(&self, year: i32) -> bool {
        self.years
            .map_or(true, |(start, end)| (start..=end).contains(&year))
    }

    /// Runs the refresh.
    ///
    /// Fetch failures are reported per shard. Only a failure to write the
    /// cache stops the run with an error.
    pub fn run(&mut self) -> Result<RefreshReport, RefreshError> {
        trace!("Running IncrementalOrchestrator::run()");
        let prefix = self.cache.prefix().to_string();
        let directory = self.cache.directory().display().to_string();
        let mut report = RefreshReport::new(self.feed.name(), &directory, &prefix, self.now);
        self.metadata.set("prefix", &prefix);
        self.metadata.set("directory", &directory);

        let cutoff = self.now - Duration::days(MODIFIED_WINDOW_DAYS);
        let mut recent: BTreeMap<String, R> = BTreeMap::new();
        let mut feed_watermark = self.metadata.feed_watermark(&prefix);

        for year in FIRST_YEAR..=self.now.year() {
            let key = ShardKey::Year(year);
            if !self.in_range(year) {
                if let Some(prior) = self.load_prior(key) {
                    collect_recent(&prior, cutoff, &mut recent);
                }
                continue;
            }
            if report.interrupted || self.shutdown.is_triggered() {
                report.interrupted = true;
                report
                    .shards
                    .push(ShardReport::skipped(key, "shutdown requested"));
                continue;
            }

            let run = match self.refresh_year(year, &prefix) {
                Ok(run) => run,
                Err(e) => {
                    error!("Unable to write the shard {}: {}", key, e);
                    self.save_metadata_after_failure();
                    return Err(e.into());
                }
            };
            if let Some(content) = &run.content {
                collect_recent(content, cutoff, &mut recent);
            }
            feed_watermark = latest(feed_watermark, run.report.watermark);
            report.interrupted |= run.interrupted;
            info!("Shard {}{}: {}", prefix, key, run.report.outcome);
            report.shards.push(run.report);
        }

        if report.interrupted {
            report.shards.push(ShardReport::skipped(
                ShardKey::Modified,
                "shutdown requested",
            ));
        } else {
            let modified = Shard::from_records(ShardKey::Modified, recent.into_values(), self.now);
            if let Err(e) = self.cache.store(&modified) {
                error!("Unable to write the shard {}: {}", ShardKey::Modified, e);
                self.save_metadata_after_failure();
                return Err(e.into());
            }
            self.metadata
                .set_watermark(&prefix, ShardKey::Modified, self.now);
            info!(
                "Shard {}{}: {} records modified since {}",
                prefix,
                ShardKey::Modified,
                modified.len(),
                cutoff
            );
            report.shards.push(ShardReport {
                shard: ShardKey::Modified,
                outcome: ShardOutcome::Updated,
                fetched: 0,
                records: modified.len(),
                watermark: Some(self.now),
            });
        }

        if let Some(watermark) = feed_watermark {
            self.metadata.set_feed_watermark(&prefix, watermark);
        }
        self.metadata.save()?;
        Ok(report)
    }

    /// Loads a stored shard. An unreadable shard is treated as absent.
    fn load_prior(&self, key: ShardKey) -> Option<Shard<R>> {
        match self.cache.load(key) {
            Ok(prior) => prior,
            Err(e) => {
                warn!("Ignoring the unreadable cached shard {}: {}", key, e);
                None
            }
        }
    }

    /// Keeps the watermarks of the shards already written.
    fn save_metadata_after_failure(&self) {
        if let Err(e) = self.metadata.save() {
            error!("Unable to save the cache metadata: {}", e);
        }
    }

    /// Decides between an incremental and a full fetch.
    fn modified_since(&self, key: ShardKey, watermark: Option<DateTime<Utc>>, has_prior: bool) -> Option<DateTime<Utc>> {
        let watermark = watermark?;
        if !has_prior {
            warn!(
                "Shard {} has a watermark but no readable cache, fetching it entirely",
                key
            );
            return None;
        }
        match self.feed.max_lookback() {
            Some(lookback) if self.now - watermark > lookback => {
                warn!(
                    "Shard {} was last updated on {}, more than {} days ago: fetching it entirely",
                    key,
                    watermark,
                    lookback.num_days()
                );
                None
            }
            _ => Some(watermark),
        }
    }

    fn refresh_year(&mut self, year: i32, prefix: &str) -> Result<ShardRun<R>, CacheError> {
        let key = ShardKey::Year(year);
        info!("Processing the shard {}{}", prefix, key);
        let prior_watermark = self.metadata.watermark(prefix, key);
        let prior = self.load_prior(key);
        let modified_since = self.modified_since(key, prior_watermark, prior.is_some());
        match modified_since {
            Some(since) => debug!("Fetching {} modified since {}", key, since),
            None => debug!("Fetching {} entirely", key),
        }

        let mut source = self.feed.open(year, modified_since, year == FIRST_YEAR);
        let mut fetched = Vec::new();
        let mut received = 0u64;
        let mut dropped = 0usize;
        let mut failure = None;
        let mut interrupted = false;

        while source.has_next() {
            match source.next() {
                Ok(page) => {
                    if page.status != 200 {
                        failure = Some(format!("upstream answered HTTP {}", page.status));
                    }
                    received += page.records.len() as u64;
                    self.reporter
                        .page_loaded(self.feed.name(), key, received, page.total_claimed);
                    for record in page.records {
                        if record.shard_key() == key {
                            fetched.push(record);
                        } else {
                            dropped += 1;
                        }
                    }
                }
                Err(FetchError::Interrupted) => {
                    interrupted = true;
                    break;
                }
                Err(e) => {
                    error!("Fetching the shard {} failed: {}", key, e);
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        let fetch_watermark = source.last_updated();
        source.close();
        if dropped > 0 {
            debug!("Dropped {} records belonging to other shards than {}", dropped, key);
        }

        if interrupted {
            return Ok(ShardRun {
                report: ShardReport::skipped(key, "shutdown requested"),
                content: prior,
                interrupted: true,
            });
        }
        if let (Some(reason), true) = (&failure, fetched.is_empty()) {
            return Ok(ShardRun {
                report: ShardReport {
                    shard: key,
                    outcome: ShardOutcome::Failed(reason.clone()),
                    fetched: 0,
                    records: prior.as_ref().map_or(0, |p| p.len()),
                    watermark: None,
                },
                content: prior,
                interrupted: false,
            });
        }

        let fetched_count = fetched.len();
        let prior_mark = prior.as_ref().map(|p| p.watermark);
        let mut shard = prior.unwrap_or_else(|| Shard::empty(key, self.now));
        shard.merge(fetched);
        shard.watermark = latest(latest(shard.max_last_modified(), fetch_watermark), prior_mark)
            .unwrap_or(self.now);
        self.cache.store(&shard)?;

        let (outcome, watermark) = match failure {
            Some(reason) => {
                warn!(
                    "Shard {} stored with {} new records, it will be fetched again",
                    key, fetched_count
                );
                (ShardOutcome::Partial(reason), None)
            }
            None => {
                self.metadata.set_watermark(prefix, key, shard.watermark);
                (ShardOutcome::Updated, Some(shard.watermark))
            }
        };
        Ok(ShardRun {
            report: ShardReport {
                shard: key,
                outcome,
                fetched: fetched_count,
                records: shard.len(),
                watermark,
            },
            content: Some(shard),
            interrupted: false,
        })
    }
}

/// Copies the records of a shard modified since `cutoff`.
fn collect_recent<R: Record>(shard: &Shard<R>, cutoff: DateTime<Utc>, recent: &mut BTreeMap<String, R>) {
    for (id, record) in &shard.records {
        if record.last_modified() >= cutoff {
            recent.insert(id.clone(), record.clone());
        }
    }
}
