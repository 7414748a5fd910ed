//! This module implements a vulnerability fetcher which downloads
//! the CVEs from the NVD.
//! https://nvd.nist.gov/developers/vulnerabilities
//!
//! The API pages with an offset (`startIndex`) and refuses date ranges over
//! 120 days; chunking a year into acceptable ranges is the job of
//! [`super::windowed::WindowedRecordSource`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{builder::PossibleValue, ValueEnum};
use log::{debug, error, trace};
use reqwest::Url;

use super::{FetchCursor, PaginatedSource};
use crate::errors::FetchError;
use crate::models::cve::{CveApiResponse, CveItem};
use crate::models::Page;
use crate::readers::http::{HttpRequest, HttpTransport};
use crate::vulnerabilities::rate_limiter::RateLimiter;
use crate::vulnerabilities::shutdown::ShutdownSignal;

/// The public endpoint of the CVE API.
pub const NVD_ENDPOINT: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// The largest page the NVD serves.
pub const MAX_RESULTS_PER_PAGE: u32 = 2000;

/// Filters taking a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CveFilter {
    CveId,
    CpeName,
    CvssV2Metrics,
    CvssV3Metrics,
    CvssV2Severity,
    CvssV3Severity,
    KeywordSearch,
    VirtualMatchString,
}

impl CveFilter {
    /// The query parameter of the filter.
    pub fn parameter(&self) -> &'static str {
        match self {
            CveFilter::CveId => "cveId",
            CveFilter::CpeName => "cpeName",
            CveFilter::CvssV2Metrics => "cvssV2Metrics",
            CveFilter::CvssV3Metrics => "cvssV3Metrics",
            CveFilter::CvssV2Severity => "cvssV2Severity",
            CveFilter::CvssV3Severity => "cvssV3Severity",
            CveFilter::KeywordSearch => "keywordSearch",
            CveFilter::VirtualMatchString => "virtualMatchString",
        }
    }
}

/// Filters without a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BooleanFilter {
    HasCertAlerts,
    HasCertNotes,
    HasKev,
    HasOval,
    IsVulnerable,
    KeywordExactMatch,
    NoRejected,
}

impl BooleanFilter {
    /// The query parameter of the filter.
    pub fn parameter(&self) -> &'static str {
        match self {
            BooleanFilter::HasCertAlerts => "hasCertAlerts",
            BooleanFilter::HasCertNotes => "hasCertNotes",
            BooleanFilter::HasKev => "hasKev",
            BooleanFilter::HasOval => "hasOval",
            BooleanFilter::IsVulnerable => "isVulnerable",
            BooleanFilter::KeywordExactMatch => "keywordExactMatch",
            BooleanFilter::NoRejected => "noRejected",
        }
    }
}

/// The CVSS severities accepted by the severity filters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl ValueEnum for Severity {
    /// Lists the variants available for clap
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
    }

    /// Map each value to a possible value in clap
    fn to_possible_value(&self) -> Option<PossibleValue> {
        match &self {
            Severity::Low => Some(PossibleValue::new("low")),
            Severity::Medium => Some(PossibleValue::new("medium")),
            Severity::High => Some(PossibleValue::new("high")),
            Severity::Critical => Some(PossibleValue::new("critical")),
        }
    }
}

/// Whether a version bound of a virtual match string is part of the range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VersionType {
    Including,
    Excluding,
}

impl VersionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionType::Including => "including",
            VersionType::Excluding => "excluding",
        }
    }
}

impl ValueEnum for VersionType {
    /// Lists the variants available for clap
    fn value_variants<'a>() -> &'a [Self] {
        &[VersionType::Including, VersionType::Excluding]
    }

    /// Map each value to a possible value in clap
    fn to_possible_value(&self) -> Option<PossibleValue> {
        match &self {
            VersionType::Including => Some(PossibleValue::new("including")),
            VersionType::Excluding => Some(PossibleValue::new("excluding")),
        }
    }
}

/// Everything needed to build the requests of an NVD query.
#[derive(Clone, Debug)]
pub struct NvdQuery {
    endpoint: String,
    api_key: Option<String>,
    results_per_page: u32,
    max_page_count: Option<u32>,
    filters: BTreeMap<CveFilter, String>,
    flags: BTreeSet<BooleanFilter>,
    published: Option<(DateTime<Utc>, DateTime<Utc>)>,
    last_modified: Option<(DateTime<Utc>, DateTime<Utc>)>,
    version_start: Option<(String, VersionType)>,
    version_end: Option<(String, VersionType)>,
}

impl NvdQuery {
    /// Creates a query on the public endpoint, without filters.
    pub fn new() -> Self {
        NvdQuery {
            endpoint: NVD_ENDPOINT.to_string(),
            api_key: None,
            results_per_page: MAX_RESULTS_PER_PAGE,
            max_page_count: None,
            filters: BTreeMap::new(),
            flags: BTreeSet::new(),
            published: None,
            last_modified: None,
            version_start: None,
            version_end: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// Empty keys are ignored.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Values outside of `1..=2000` are ignored.
    pub fn with_results_per_page(mut self, results_per_page: u32) -> Self {
        if (1..=MAX_RESULTS_PER_PAGE).contains(&results_per_page) {
            self.results_per_page = results_per_page;
        }
        self
    }

    /// Stops after this many pages. Zero means no limit.
    pub fn with_max_page_count(mut self, max_page_count: u32) -> Self {
        self.max_page_count = if max_page_count > 0 {
            Some(max_page_count)
        } else {
            None
        };
        self
    }

    pub fn with_filter(mut self, filter: CveFilter, value: &str) -> Self {
        self.filters.insert(filter, value.to_string());
        self
    }

    pub fn with_flag(mut self, flag: BooleanFilter) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn with_published_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.published = Some((start, end));
        self
    }

    pub fn with_last_modified_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.last_modified = Some((start, end));
        self
    }

    /// The NVD only honours version bounds along with a
    /// [`CveFilter::VirtualMatchString`].
    pub fn with_version_start(mut self, version: &str, kind: VersionType) -> Self {
        self.version_start = Some((version.to_string(), kind));
        self
    }

    pub fn with_version_end(mut self, version: &str, kind: VersionType) -> Self {
        self.version_end = Some((version.to_string(), kind));
        self
    }

    pub fn remove_last_modified_range(mut self) -> Self {
        self.last_modified = None;
        self
    }

    /// Builds the request for the page starting at `start_index`.
    pub fn request(&self, start_index: u64) -> Result<HttpRequest, FetchError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| FetchError::Config(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("resultsPerPage", &self.results_per_page.to_string());
            pairs.append_pair("startIndex", &start_index.to_string());
            for (filter, value) in &self.filters {
                pairs.append_pair(filter.parameter(), value);
            }
            for flag in &self.flags {
                pairs.append_key_only(flag.parameter());
            }
            if let Some((version, kind)) = &self.version_start {
                pairs.append_pair("versionStart", version);
                pairs.append_pair("versionStartType", kind.as_str());
            }
            if let Some((version, kind)) = &self.version_end {
                pairs.append_pair("versionEnd", version);
                pairs.append_pair("versionEndType", kind.as_str());
            }
            if let Some((start, end)) = &self.published {
                pairs.append_pair("pubStartDate", &format_date(start));
                pairs.append_pair("pubEndDate", &format_date(end));
            }
            if let Some((start, end)) = &self.last_modified {
                pairs.append_pair("lastModStartDate", &format_date(start));
                pairs.append_pair("lastModEndDate", &format_date(end));
            }
        }

        let mut request = HttpRequest::get(url.as_str());
        if let Some(api_key) = &self.api_key {
            request = request.with_header("apiKey", api_key);
        }
        Ok(request)
    }
}

impl Default for NvdQuery {
    fn default() -> Self {
        Self::new()
    }
}

/// The date format of the NVD query parameters.
fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

/// Pages through the CVEs matching an [`NvdQuery`].
pub struct NvdCveClient {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
    query: NvdQuery,
    cursor: FetchCursor,
    pages: u32,
}

impl NvdCveClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownSignal,
        query: NvdQuery,
    ) -> Self {
        NvdCveClient {
            transport,
            limiter,
            shutdown,
            query,
            cursor: FetchCursor::new(),
            pages: 0,
        }
    }

    /// The number of CVEs the NVD claims to match the query.
    pub fn total_available(&self) -> u64 {
        self.cursor.total_claimed()
    }

    /// Moves to the failed state and hands the error back.
    fn fail<T>(&mut self, status: Option<u16>, error: FetchError) -> Result<T, FetchError> {
        self.cursor.fail(status);
        Err(error)
    }
}

impl PaginatedSource<CveItem> for NvdCveClient {
    fn has_next(&self) -> bool {
        self.cursor.has_next()
    }

    fn next(&mut self) -> Result<Page<CveItem>, FetchError> {
        trace!("Running NvdCveClient::next()");
        self.cursor.ensure_next()?;
        let start_index = self
            .cursor
            .pending_cursor()
            .and_then(|c| c.parse::<u64>().ok())
            .unwrap_or(0);
        let request = match self.query.request(start_index) {
            Ok(r) => r,
            Err(e) => return self.fail(None, e),
        };

        if let Err(e) = self.limiter.acquire(&self.shutdown) {
            return self.fail(None, e);
        }
        debug!("Requesting {}", request.url);
        let response = match self.transport.execute(&request) {
            Ok(r) => r,
            Err(e) => return self.fail(None, e),
        };

        if response.status != 200 {
            error!("Invalid HTTP response code from the NVD: {}", response.status);
            error!("{}", response.body);
            return self.fail(
                Some(response.status),
                FetchError::Rejected {
                    status: response.status,
                    body: response.body,
                },
            );
        }

        let nvd_response: CveApiResponse = match serde_json::from_str(&response.body) {
            Ok(n) => n,
            Err(e) => {
                error!("Invalid JSON returned by NVD API.");
                return self.fail(None, e.into());
            }
        };

        self.pages += 1;
        let returned = nvd_response.vulnerabilities.len() as u64;
        let next_index = nvd_response.start_index + returned;
        let page_limit_reached = self
            .query
            .max_page_count
            .is_some_and(|max| self.pages >= max);
        let next_cursor = if returned > 0 && next_index < nvd_response.total_results && !page_limit_reached {
            Some(next_index.to_string())
        } else {
            None
        };

        self.cursor.record_page(
            nvd_response.vulnerabilities.len(),
            next_cursor.clone(),
            nvd_response.total_results,
            Some(nvd_response.timestamp),
        );

        Ok(Page {
            records: nvd_response.vulnerabilities,
            status: response.status,
            next_cursor,
            total_claimed: nvd_response.total_results,
        })
    }

    fn last_status_code(&self) -> u16 {
        self.cursor.last_status()
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.cursor.last_updated()
    }

    fn close(&mut self) {
        self.cursor.close();
    }
}
