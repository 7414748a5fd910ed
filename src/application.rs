//! This module contains the main structure and logic for the whole
//! application.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, trace, warn, LevelFilter};
use simple_logger::SimpleLogger;

use crate::errors::{FetchError, RefreshError};
use crate::models::Record;
use crate::readers::http::{HttpReader, HttpTransport};
use crate::vulnerabilities::cache_managers::files::ShardedCache;
use crate::vulnerabilities::cache_managers::metadata::CacheMetadata;
use crate::vulnerabilities::fetchers::ghsa::AdvisoryQuery;
use crate::vulnerabilities::fetchers::nvd::{BooleanFilter, CveFilter, NvdQuery, Severity, VersionType};
use crate::vulnerabilities::orchestrator::{GhsaFeed, IncrementalOrchestrator, NvdFeed, ShardFeed};
use crate::vulnerabilities::rate_limiter::RateLimiter;
use crate::vulnerabilities::shutdown::ShutdownSignal;
use crate::vulnerabilities::VulnSource;
use crate::writers::json::JsonWriter;
use crate::writers::textstdout::TextStdoutWriter;
use crate::writers::{Writer, Writers};

/// At least one year shard got new data.
pub const EXIT_SUCCESS: i32 = 0;
/// Every shard failed, or the cache could not be written.
pub const EXIT_FAILURE: i32 = 1;
/// The command line is not usable.
pub const EXIT_CONFIG: i32 = 2;
/// Interrupted before any shard got new data.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Represents the application
pub struct Application {
    /// The arguments given on the command line.
    argv: Option<Args>,
    /// Fired on Ctrl-C.
    shutdown: ShutdownSignal,
}

impl Application {
    /// Creates a new application
    pub fn new() -> Self {
        trace!("In Application::new()");
        Application {
            argv: None,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Read argv to get the arguments before running the application.
    /// Also installs the logger, at the level asked for.
    pub fn read_argv(&mut self) {
        let args = Args::parse();
        let level = match (args.quiet, args.verbose) {
            (true, _) => LevelFilter::Warn,
            (false, 0) => LevelFilter::Info,
            (false, 1) => LevelFilter::Debug,
            (false, _) => LevelFilter::Trace,
        };
        if let Err(e) = SimpleLogger::new().with_level(level).init() {
            eprintln!("Unable to initialize the logger: {}", e);
        }
        trace!("In Application::read_argv()");
        debug!("Arguments: {:?}", args.redacted());
        self.argv = Some(args);
    }

    /// Triggers the shutdown signal on Ctrl-C.
    fn install_interrupt_handler(&self) {
        let shutdown = self.shutdown.clone();
        let spawned = thread::Builder::new()
            .name("ctrl-c".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(r) => r,
                    Err(e) => {
                        error!("Unable to listen to Ctrl-C: {}", e);
                        return;
                    }
                };
                if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                    warn!("Ctrl-C received, abandoning the current shard and stopping");
                    shutdown.trigger();
                }
            });
        if let Err(e) = spawned {
            error!("Unable to listen to Ctrl-C: {}", e);
        }
    }

    /// Runs the global application and returns the exit code.
    /// read_argv() MUST have been called before
    pub fn run(&self) -> i32 {
        trace!("Running Application::run()");
        let Some(args) = self.argv.as_ref() else {
            error!("CLI arguments haven't been read.");
            return EXIT_CONFIG;
        };
        let settings = match Settings::from_args(args) {
            Ok(s) => s,
            Err(e) => {
                error!("{}", e);
                return EXIT_CONFIG;
            }
        };
        self.install_interrupt_handler();

        let transport: Arc<dyn HttpTransport> = match HttpReader::new(args.threads, self.shutdown.clone()) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                error!("{}", e);
                return EXIT_FAILURE;
            }
        };

        match args.source {
            VulnSource::Nvd => {
                let query = settings.nvd_query(args);
                let limiter = match args.delay {
                    Some(delay) => RateLimiter::new(1, Duration::from_millis(delay)),
                    None => RateLimiter::for_nvd(query.has_api_key()),
                };
                let feed = NvdFeed::new(transport, Arc::new(limiter), self.shutdown.clone(), query);
                self.refresh(Box::new(feed), args, &settings)
            }
            VulnSource::Ghsa => {
                let token = settings.github_token.clone().unwrap_or_default();
                let mut query = AdvisoryQuery::new(&token);
                if let Some(endpoint) = &args.endpoint {
                    query = query.with_endpoint(endpoint);
                }
                let limiter = match args.delay {
                    Some(delay) => RateLimiter::new(1, Duration::from_millis(delay)),
                    None => RateLimiter::for_github(),
                };
                let feed = GhsaFeed::new(transport, Arc::new(limiter), self.shutdown.clone(), query);
                self.refresh(Box::new(feed), args, &settings)
            }
        }
    }

    /// Refreshes the cache from a feed, writes the report and picks the
    /// exit code.
    fn refresh<R: Record>(&self, feed: Box<dyn ShardFeed<R>>, args: &Args, settings: &Settings) -> i32 {
        let cache = match ShardedCache::new(&args.directory, &settings.prefix) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return EXIT_FAILURE;
            }
        };
        let metadata = match CacheMetadata::load(&args.directory) {
            Ok(m) => m,
            Err(e) => {
                error!("{}", e);
                return EXIT_FAILURE;
            }
        };

        info!(
            "Refreshing {} into {}",
            feed.name(),
            args.directory.display()
        );
        let mut orchestrator = IncrementalOrchestrator::new(feed, cache, metadata, self.shutdown.clone())
            .with_years(args.start_year, args.end_year);
        let report = match orchestrator.run() {
            Ok(r) => r,
            Err(e) => {
                error!("Refresh aborted: {}", e);
                return EXIT_FAILURE;
            }
        };

        info!("Refresh finished, writing output");
        let writer: Box<dyn Writer> = match args.writer {
            Writers::TextStdout => Box::new(TextStdoutWriter::new()),
            Writers::Json => Box::new(JsonWriter::new()),
        };
        writer.write(&report);

        match report.result() {
            Ok(()) => EXIT_SUCCESS,
            Err(RefreshError::Interrupted) => {
                warn!("{}", RefreshError::Interrupted);
                EXIT_INTERRUPTED
            }
            Err(e) => {
                error!("{}", e);
                EXIT_FAILURE
            }
        }
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

/// The arguments once checked.
#[derive(Debug)]
struct Settings {
    prefix: String,
    api_key: Option<String>,
    github_token: Option<String>,
}

impl Settings {
    fn from_args(args: &Args) -> Result<Self, FetchError> {
        if let (Some(start), Some(end)) = (args.start_year, args.end_year) {
            if start > end {
                return Err(FetchError::Config(format!(
                    "the start year {} is after the end year {}",
                    start, end
                )));
            }
        }

        let api_key = usable_secret("--api-key", args.api_key.as_deref());
        let github_token = usable_secret("--github-token", args.github_token.as_deref());
        if args.source == VulnSource::Ghsa && github_token.is_none() {
            return Err(FetchError::Config(
                "a GitHub token is required to fetch the security advisories".to_string(),
            ));
        }

        let prefix = args
            .prefix
            .clone()
            .unwrap_or_else(|| args.source.default_prefix().to_string());
        Ok(Settings {
            prefix,
            api_key,
            github_token,
        })
    }

    fn nvd_query(&self, args: &Args) -> NvdQuery {
        let mut query = NvdQuery::new()
            .with_api_key(self.api_key.clone())
            .with_results_per_page(args.results_per_page)
            .with_max_page_count(args.max_page_count.unwrap_or(0));
        if let Some(endpoint) = &args.endpoint {
            query = query.with_endpoint(endpoint);
        }
        let filters = [
            (CveFilter::CveId, args.cve_id.clone()),
            (CveFilter::CpeName, args.cpe_name.clone()),
            (CveFilter::KeywordSearch, args.keyword_search.clone()),
            (CveFilter::CvssV2Metrics, args.cvss_v2_metrics.clone()),
            (CveFilter::CvssV3Metrics, args.cvss_v3_metrics.clone()),
            (CveFilter::VirtualMatchString, args.virtual_match_string.clone()),
            (
                CveFilter::CvssV2Severity,
                args.cvss_v2_severity.map(|s| s.as_str().to_string()),
            ),
            (
                CveFilter::CvssV3Severity,
                args.cvss_v3_severity.map(|s| s.as_str().to_string()),
            ),
        ];
        for (filter, value) in filters {
            if let Some(value) = value {
                query = query.with_filter(filter, &value);
            }
        }
        if let Some(version) = &args.version_start {
            query = query.with_version_start(version, args.version_start_type);
        }
        if let Some(version) = &args.version_end {
            query = query.with_version_end(version, args.version_end_type);
        }
        let flags = [
            (BooleanFilter::KeywordExactMatch, args.keyword_exact_match),
            (BooleanFilter::HasKev, args.has_kev),
            (BooleanFilter::NoRejected, args.no_rejected),
            (BooleanFilter::IsVulnerable, args.is_vulnerable),
            (BooleanFilter::HasCertAlerts, args.has_cert_alerts),
            (BooleanFilter::HasCertNotes, args.has_cert_notes),
            (BooleanFilter::HasOval, args.has_oval),
        ];
        for (flag, enabled) in flags {
            if enabled {
                query = query.with_flag(flag);
            }
        }
        query
    }
}

/// Drops empty secrets and unresolved password manager references.
fn usable_secret(name: &str, value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        warn!("Ignoring the empty value of {}", name);
        None
    } else if value.starts_with("op://") {
        warn!(
            "Ignoring {}: {} is an unresolved 1Password reference",
            name, value
        );
        None
    } else {
        Some(value.to_string())
    }
}

/// Represents the CLI arguments accepted by vulnmirror
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The feed to mirror
    #[arg(short, long, value_name = "SOURCE", default_value = "nvd")]
    pub source: VulnSource,
    /// The directory of the cache
    #[arg(short, long, value_name = "DIRECTORY")]
    pub directory: PathBuf,
    /// The prefix of the cache files (default: nvdcve- or ghsa-)
    #[arg(short, long, value_name = "PREFIX")]
    pub prefix: Option<String>,
    /// The NVD API key
    #[arg(long, value_name = "API_KEY", env = "NVD_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// The GitHub token, needed for the security advisories
    #[arg(long, value_name = "TOKEN", env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,
    /// Overrides the endpoint of the feed
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,
    /// The number of CVEs per NVD page
    #[arg(long, value_name = "COUNT", default_value_t = 2000, value_parser = clap::value_parser!(u32).range(1..=2000))]
    pub results_per_page: u32,
    /// Stops each NVD date window after this many pages
    #[arg(long, value_name = "COUNT")]
    pub max_page_count: Option<u32>,
    /// The number of threads of the HTTP runtime
    #[arg(long, value_name = "THREADS", default_value_t = 1)]
    pub threads: usize,
    /// Waits this many milliseconds between two requests, instead of the
    /// default rate limit of the feed
    #[arg(long, value_name = "MILLISECONDS")]
    pub delay: Option<u64>,
    /// The first year shard to refresh
    #[arg(long, value_name = "YEAR")]
    pub start_year: Option<i32>,
    /// The last year shard to refresh
    #[arg(long, value_name = "YEAR")]
    pub end_year: Option<i32>,
    /// Only this CVE
    #[arg(long, value_name = "CVE_ID")]
    pub cve_id: Option<String>,
    /// Only the CVEs of this CPE
    #[arg(long, value_name = "CPE")]
    pub cpe_name: Option<String>,
    /// Only the CVEs of the CPEs matching this partial CPE
    #[arg(long, value_name = "CPE")]
    pub virtual_match_string: Option<String>,
    /// The lowest version matched by --virtual-match-string
    #[arg(long, value_name = "VERSION", requires = "virtual_match_string")]
    pub version_start: Option<String>,
    /// Whether --version-start is part of the range
    #[arg(long, value_name = "TYPE", default_value = "including")]
    pub version_start_type: VersionType,
    /// The highest version matched by --virtual-match-string
    #[arg(long, value_name = "VERSION", requires = "virtual_match_string")]
    pub version_end: Option<String>,
    /// Whether --version-end is part of the range
    #[arg(long, value_name = "TYPE", default_value = "including")]
    pub version_end_type: VersionType,
    /// Only the CVEs whose description contains these words
    #[arg(long, value_name = "KEYWORDS")]
    pub keyword_search: Option<String>,
    /// Match the keywords as an exact phrase
    #[arg(long)]
    pub keyword_exact_match: bool,
    /// Only the CVEs with this CVSSv2 severity
    #[arg(long, value_name = "SEVERITY")]
    pub cvss_v2_severity: Option<Severity>,
    /// Only the CVEs with this CVSSv3 severity
    #[arg(long, value_name = "SEVERITY")]
    pub cvss_v3_severity: Option<Severity>,
    /// Only the CVEs with this CVSSv2 vector string
    #[arg(long, value_name = "VECTOR")]
    pub cvss_v2_metrics: Option<String>,
    /// Only the CVEs with this CVSSv3 vector string
    #[arg(long, value_name = "VECTOR")]
    pub cvss_v3_metrics: Option<String>,
    /// Only the CVEs in the CISA KEV catalog
    #[arg(long)]
    pub has_kev: bool,
    /// Exclude the rejected CVEs
    #[arg(long)]
    pub no_rejected: bool,
    /// Only the CVEs of the vulnerable CPE given with --cpe-name
    #[arg(long)]
    pub is_vulnerable: bool,
    /// Only the CVEs with a US-CERT technical alert
    #[arg(long)]
    pub has_cert_alerts: bool,
    /// Only the CVEs with a CERT/CC vulnerability note
    #[arg(long)]
    pub has_cert_notes: bool,
    /// Only the CVEs with an OVAL record
    #[arg(long)]
    pub has_oval: bool,
    /// The writer to use
    #[arg(short, long, value_name = "WRITER", default_value = "textstdout")]
    pub writer: Writers,
    /// More logs, twice for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// A copy safe to log.
    fn redacted(&self) -> Args {
        let mut args = self.clone();
        let hide = |s: Option<String>| s.map(|_| "***".to_string());
        args.api_key = hide(args.api_key);
        args.github_token = hide(args.github_token);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_follow_the_source() {
        let args = parse(&["vulnmirror", "--directory", "/tmp/nvd", "--api-key", "key"]);
        assert_eq!(VulnSource::Nvd, args.source);
        assert_eq!(2000, args.results_per_page);
        assert_eq!(Writers::TextStdout, args.writer);
        let settings = Settings::from_args(&args).unwrap();
        assert_eq!("nvdcve-", settings.prefix);
        assert!(settings.nvd_query(&args).has_api_key());
    }

    #[test]
    fn nvd_filters_are_forwarded() {
        let args = parse(&[
            "vulnmirror",
            "-d",
            "/tmp/nvd",
            "--cpe-name",
            "cpe:2.3:a:jquery:jquery:1.8.3",
            "--cvss-v3-severity",
            "critical",
            "--no-rejected",
            "--has-kev",
        ]);
        let settings = Settings::from_args(&args).unwrap();
        let url = settings.nvd_query(&args).request(0).unwrap().url;
        assert!(url.contains("cpeName=cpe%3A2.3%3Aa%3Ajquery%3Ajquery%3A1.8.3"));
        assert!(url.contains("cvssV3Severity=CRITICAL"));
        assert!(url.contains("&hasKev"));
        assert!(url.contains("&noRejected"));
    }

    #[test]
    fn virtual_match_filters_are_forwarded() {
        let args = parse(&[
            "vulnmirror",
            "-d",
            "/tmp/nvd",
            "--cve-id",
            "CVE-2021-44228",
            "--cvss-v3-metrics",
            "AV:N/AC:L",
            "--virtual-match-string",
            "cpe:2.3:a:apache:log4j",
            "--version-start",
            "2.0",
            "--version-end",
            "2.15.0",
            "--version-end-type",
            "excluding",
        ]);
        let settings = Settings::from_args(&args).unwrap();
        let url = settings.nvd_query(&args).request(0).unwrap().url;
        assert!(url.contains("cveId=CVE-2021-44228"));
        assert!(url.contains("cvssV3Metrics=AV%3AN%2FAC%3AL"));
        assert!(url.contains("virtualMatchString=cpe%3A2.3%3Aa%3Aapache%3Alog4j"));
        assert!(url.contains("versionStart=2.0&versionStartType=including"));
        assert!(url.contains("versionEnd=2.15.0&versionEndType=excluding"));
    }

    #[test]
    fn version_bounds_need_a_virtual_match_string() {
        assert!(Args::try_parse_from(["vulnmirror", "-d", "/tmp", "--version-start", "2.0"]).is_err());
    }

    #[test]
    fn out_of_range_pages_are_refused() {
        assert!(Args::try_parse_from(["vulnmirror", "-d", "/tmp", "--results-per-page", "5000"]).is_err());
        assert!(Args::try_parse_from(["vulnmirror", "-d", "/tmp", "--results-per-page", "0"]).is_err());
    }

    #[test]
    fn advisories_need_a_usable_token() {
        let args = parse(&["vulnmirror", "-s", "ghsa", "-d", "/tmp/ghsa", "--github-token", "op://vault/github/token"]);
        assert!(matches!(Settings::from_args(&args), Err(FetchError::Config(_))));

        let args = parse(&["vulnmirror", "-s", "ghsa", "-d", "/tmp/ghsa", "--github-token", "ghp_abc"]);
        let settings = Settings::from_args(&args).unwrap();
        assert_eq!("ghsa-", settings.prefix);
        assert_eq!(Some("ghp_abc".to_string()), settings.github_token);
    }

    #[test]
    fn year_range_must_be_ordered() {
        let args = parse(&["vulnmirror", "-d", "/tmp", "--start-year", "2020", "--end-year", "2019"]);
        assert!(matches!(Settings::from_args(&args), Err(FetchError::Config(_))));
    }

    #[test]
    fn secrets_are_not_logged() {
        let args = parse(&["vulnmirror", "-d", "/tmp", "--api-key", "secret-key"]);
        assert!(!format!("{:?}", args.redacted()).contains("secret-key"));
    }
}
