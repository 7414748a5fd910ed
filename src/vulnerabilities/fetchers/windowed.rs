//! Year by year retrieval of the NVD CVEs.
//!
//! The NVD refuses published date ranges over 120 days. A year is therefore
//! walked as a sequence of contiguous [`DateWindow`]s of at most
//! [`MAX_SPAN_DAYS`] days, each drained through its own [`NvdCveClient`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::{debug, error, info, trace};

use super::nvd::{NvdCveClient, NvdQuery};
use super::{FetchCursor, PaginatedSource};
use crate::errors::FetchError;
use crate::models::cve::CveItem;
use crate::models::{latest, Page, Record};
use crate::readers::http::HttpTransport;
use crate::vulnerabilities::rate_limiter::RateLimiter;
use crate::vulnerabilities::shutdown::ShutdownSignal;

/// The longest window requested, under the 120 days the NVD accepts.
pub const MAX_SPAN_DAYS: i64 = 115;

/// The status reported when a window failed without an HTTP response.
pub const NO_RESPONSE_STATUS: u16 = 0;

/// A published date range, both ends included, at millisecond precision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Splits a year into windows of at most [`MAX_SPAN_DAYS`] days.
///
/// Windows follow each other with no gap nor overlap. No window starts after
/// `now`, and the last one is cut at `now`.
pub fn year_windows(year: i32, now: DateTime<Utc>) -> Vec<DateWindow> {
    let mut windows = Vec::new();
    let (Some(mut day), Some(last_day)) = (
        NaiveDate::from_ymd_opt(year, 1, 1),
        NaiveDate::from_ymd_opt(year, 12, 31),
    ) else {
        return windows;
    };

    while day <= last_day {
        let start = day.and_time(NaiveTime::MIN).and_utc();
        if start > now {
            break;
        }
        let end_day = (day + Duration::days(MAX_SPAN_DAYS - 1)).min(last_day);
        let end = (end_day + Duration::days(1)).and_time(NaiveTime::MIN).and_utc()
            - Duration::milliseconds(1);
        windows.push(DateWindow {
            start,
            end: end.min(now),
        });
        day = end_day + Duration::days(1);
    }
    windows
}

/// Returns every CVE of a list of years, one page per year.
///
/// A year whose fetch fails is returned with what was gathered before the
/// failure, and the following years are still fetched. The last page then
/// carries the status of the first failure and the source ends `Failed`.
pub struct WindowedRecordSource {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
    query: NvdQuery,
    years: VecDeque<i32>,
    modified_since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cursor: FetchCursor,
    /// The status of the first year that failed.
    first_failure: Option<u16>,
}

impl WindowedRecordSource {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownSignal,
        query: NvdQuery,
        years: impl IntoIterator<Item = i32>,
    ) -> Self {
        let years: VecDeque<i32> = years.into_iter().collect();
        let mut cursor = FetchCursor::new();
        if years.is_empty() {
            cursor.close();
        }
        WindowedRecordSource {
            transport,
            limiter,
            shutdown,
            query,
            years,
            modified_since: None,
            now: Utc::now(),
            cursor,
            first_failure: None,
        }
    }

    /// Only return the CVEs modified since this date.
    pub fn with_modified_since(mut self, modified_since: Option<DateTime<Utc>>) -> Self {
        self.modified_since = modified_since;
        self
    }

    /// Overrides the current time, which bounds the last window.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn window_query(&self, window: &DateWindow) -> NvdQuery {
        let query = self
            .query
            .clone()
            .with_published_range(window.start, window.end);
        match self.modified_since {
            Some(since) => query.with_last_modified_range(since, self.now),
            None => query.remove_last_modified_range(),
        }
    }
}

impl PaginatedSource<CveItem> for WindowedRecordSource {
    fn has_next(&self) -> bool {
        self.cursor.has_next()
    }

    fn next(&mut self) -> Result<Page<CveItem>, FetchError> {
        trace!("Running WindowedRecordSource::next()");
        self.cursor.ensure_next()?;
        let Some(year) = self.years.pop_front() else {
            self.cursor.close();
            return Err(FetchError::NoMorePages);
        };
        info!("Fetching the CVEs published in {}", year);

        // Keyed by id: the copy fetched last wins, and the output is sorted.
        let mut records: BTreeMap<String, CveItem> = BTreeMap::new();
        let mut watermark = None;
        let mut failed_status = None;

        for window in year_windows(year, self.now) {
            debug!("Window {} .. {}", window.start, window.end);
            let mut client = NvdCveClient::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.limiter),
                self.shutdown.clone(),
                self.window_query(&window),
            );
            while client.has_next() {
                match client.next() {
                    Ok(page) => {
                        for record in page.records {
                            records.insert(record.id().to_string(), record);
                        }
                    }
                    Err(FetchError::Interrupted) => {
                        self.cursor.fail(None);
                        return Err(FetchError::Interrupted);
                    }
                    Err(e) => {
                        error!(
                            "Fetching {} aborted in the window starting {}: {}",
                            year, window.start, e
                        );
                        let status = client.last_status_code();
                        failed_status = Some(if status == 200 {
                            NO_RESPONSE_STATUS
                        } else {
                            status
                        });
                        break;
                    }
                }
            }
            watermark = latest(watermark, client.last_updated());
            client.close();
            if failed_status.is_some() {
                break;
            }
        }

        if let Some(status) = failed_status {
            self.first_failure.get_or_insert(status);
            if !self.years.is_empty() {
                info!("Going on with the years after {} despite the failure", year);
            }
        }

        let records: Vec<CveItem> = records.into_values().collect();
        let next_cursor = self.years.front().map(|y| y.to_string());
        let total_claimed = self.cursor.total_seen() + records.len() as u64;
        self.cursor
            .record_page(records.len(), next_cursor.clone(), total_claimed, watermark);
        info!("Fetched {} CVEs for {}", records.len(), year);

        let mut status = 200;
        if next_cursor.is_none() {
            if let Some(failure) = self.first_failure {
                self.cursor.fail(Some(failure));
                status = failure;
            }
        }
        Ok(Page {
            records,
            status,
            next_cursor,
            total_claimed,
        })
    }

    fn last_status_code(&self) -> u16 {
        self.cursor.last_status()
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.cursor.last_updated()
    }

    fn close(&mut self) {
        self.years.clear();
        self.cursor.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cve_item, nvd_body, ScriptedTransport};

    fn at(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    fn assert_contiguous(windows: &[DateWindow]) {
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end + Duration::milliseconds(1), pair[1].start);
        }
        for window in windows {
            assert!(window.end - window.start <= Duration::days(MAX_SPAN_DAYS));
            assert!(window.start <= window.end);
        }
    }

    #[test]
    fn windows_cover_a_whole_year() {
        let windows = year_windows(2023, at("2026-10-18T10:00:00Z"));
        assert_eq!(4, windows.len());
        assert_eq!(at("2023-01-01T00:00:00Z"), windows[0].start);
        assert_eq!(at("2023-12-31T23:59:59.999Z"), windows[3].end);
        assert_contiguous(&windows);

        let days: i64 = windows
            .iter()
            .map(|w| (w.end - w.start + Duration::milliseconds(1)).num_days())
            .sum();
        assert_eq!(365, days);
    }

    #[test]
    fn windows_cover_a_leap_year() {
        let windows = year_windows(2024, at("2026-10-18T10:00:00Z"));
        assert_contiguous(&windows);
        let days: i64 = windows
            .iter()
            .map(|w| (w.end - w.start + Duration::milliseconds(1)).num_days())
            .sum();
        assert_eq!(366, days);
    }

    #[test]
    fn current_year_stops_at_now() {
        let now = at("2026-06-10T12:30:00Z");
        let windows = year_windows(2026, now);
        assert_eq!(2, windows.len());
        assert_eq!(now, windows[1].end);
        assert_contiguous(&windows);
        assert!(year_windows(2027, now).is_empty());
    }

    #[test]
    fn a_year_is_fetched_window_by_window() {
        let transport = Arc::new(ScriptedTransport::new());
        let windows = year_windows(2023, at("2026-10-18T10:00:00Z"));
        // The same CVE shows up in two windows; the later copy is kept.
        let b_old = cve_item("CVE-2023-0002", "2023-04-25T00:00:00.000", "2023-05-01T00:00:00.000");
        let b_new = cve_item("CVE-2023-0002", "2023-04-25T00:00:00.000", "2023-06-01T00:00:00.000");
        let a = cve_item("CVE-2023-0001", "2023-01-10T00:00:00.000", "2023-02-01T00:00:00.000");
        let c = cve_item("CVE-2023-0003", "2023-12-10T00:00:00.000", "2023-12-11T00:00:00.000");
        transport.respond(200, &nvd_body(0, 2, "2026-10-18T10:00:00.000", &[b_old, a]));
        transport.respond(200, &nvd_body(0, 1, "2026-10-18T10:00:01.000", &[b_new.clone()]));
        transport.respond(200, &nvd_body(0, 0, "2026-10-18T10:00:02.000", &[]));
        transport.respond(200, &nvd_body(0, 1, "2026-10-18T10:00:03.000", &[c]));

        let since = at("2023-01-01T00:00:00Z");
        let mut source = WindowedRecordSource::new(
            transport.clone(),
            Arc::new(RateLimiter::new(100, std::time::Duration::from_millis(10))),
            ShutdownSignal::new(),
            NvdQuery::new(),
            [2023],
        )
        .with_now(at("2026-10-18T10:00:00Z"))
        .with_modified_since(Some(since));

        let page = source.next().unwrap();
        assert_eq!(200, page.status);
        let ids: Vec<&str> = page.records.iter().map(|r| r.id()).collect();
        assert_eq!(vec!["CVE-2023-0001", "CVE-2023-0002", "CVE-2023-0003"], ids);
        assert_eq!(b_new, page.records[1]);
        assert!(!source.has_next());
        assert_eq!(Some(at("2026-10-18T10:00:03Z")), source.last_updated());

        let requests = transport.requests();
        assert_eq!(windows.len(), requests.len());
        for request in &requests {
            assert!(request.url.contains("lastModStartDate=2023-01-01T00%3A00%3A00.000"));
        }
        assert!(requests[1].url.contains("pubStartDate=2023-04-26T00%3A00%3A00.000"));
    }

    #[test]
    fn a_failed_window_returns_the_partial_year() {
        let transport = Arc::new(ScriptedTransport::new());
        let now = at("2026-10-18T10:00:00Z");
        let a = cve_item("CVE-2023-0001", "2023-01-10T00:00:00.000", "2023-02-01T00:00:00.000");
        transport.respond(200, &nvd_body(0, 1, "2026-10-18T10:00:00.000", &[a]));
        transport.respond(503, "Service Unavailable");
        let b = cve_item("CVE-2024-0001", "2024-01-10T00:00:00.000", "2024-02-01T00:00:00.000");
        transport.respond(200, &nvd_body(0, 1, "2026-10-18T10:00:00.000", &[b]));
        for _ in 1..year_windows(2024, now).len() {
            transport.respond(200, &nvd_body(0, 0, "2026-10-18T10:00:00.000", &[]));
        }

        let mut source = WindowedRecordSource::new(
            transport.clone(),
            Arc::new(RateLimiter::new(100, std::time::Duration::from_millis(10))),
            ShutdownSignal::new(),
            NvdQuery::new(),
            [2023, 2024],
        )
        .with_now(now);

        // The rest of 2023 is abandoned, 2024 is still fetched.
        let page = source.next().unwrap();
        assert_eq!(200, page.status);
        assert_eq!(1, page.records.len());
        assert!(source.has_next());

        let page = source.next().unwrap();
        assert_eq!(503, page.status);
        assert_eq!("CVE-2024-0001", page.records[0].id());
        assert_eq!(503, source.last_status_code());
        assert!(!source.has_next());
        assert_eq!(0, transport.remaining());
        assert_eq!(2 + year_windows(2024, now).len(), transport.requests().len());
    }

    #[test]
    fn a_failed_early_year_does_not_stop_the_later_ones() {
        let transport = Arc::new(ScriptedTransport::new());
        let now = at("2026-10-18T10:00:00Z");
        transport.fail(FetchError::Transport("connection reset".to_string()));
        let windows = year_windows(2002, now);
        for (i, window) in windows.iter().enumerate() {
            let published = window.start.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
            let item = cve_item(&format!("CVE-2002-000{}", i), &published, &published);
            transport.respond(200, &nvd_body(0, 1, "2026-10-18T10:00:00.000", &[item]));
        }

        let mut source = WindowedRecordSource::new(
            transport.clone(),
            Arc::new(RateLimiter::new(100, std::time::Duration::from_millis(10))),
            ShutdownSignal::new(),
            NvdQuery::new(),
            [2001, 2002],
        )
        .with_now(now);

        let first = source.next().unwrap();
        assert!(first.records.is_empty());
        assert_eq!(Some("2002".to_string()), first.next_cursor);
        let second = source.next().unwrap();
        assert_eq!(windows.len(), second.records.len());
        assert_eq!(NO_RESPONSE_STATUS, second.status);
        assert_eq!(NO_RESPONSE_STATUS, source.last_status_code());
        assert!(!source.has_next());
        assert_eq!(0, transport.remaining());
        assert_eq!(1 + windows.len(), transport.requests().len());
    }

    #[test]
    fn years_are_returned_in_order() {
        let transport = Arc::new(ScriptedTransport::new());
        let now = at("2026-02-01T00:00:00Z");
        let windows_2025 = year_windows(2025, now).len();
        for _ in 0..windows_2025 {
            transport.respond(200, &nvd_body(0, 0, "2026-02-01T00:00:00.000", &[]));
        }
        let x = cve_item("CVE-2026-0001", "2026-01-10T00:00:00.000", "2026-01-11T00:00:00.000");
        transport.respond(200, &nvd_body(0, 1, "2026-02-01T00:00:00.000", &[x]));

        let mut source = WindowedRecordSource::new(
            transport.clone(),
            Arc::new(RateLimiter::new(100, std::time::Duration::from_millis(10))),
            ShutdownSignal::new(),
            NvdQuery::new(),
            [2025, 2026],
        )
        .with_now(now);
        let first = source.next().unwrap();
        assert!(first.records.is_empty());
        assert_eq!(Some("2026".to_string()), first.next_cursor);
        let second = source.next().unwrap();
        assert_eq!(1, second.records.len());
        assert!(!source.has_next());
    }
}
