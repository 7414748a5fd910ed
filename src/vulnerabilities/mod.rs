//! The vulnerabilities module contains what's needed to mirror
//! vulnerability feeds in a local cache.
//!
//! It is composed of two parts, fetchers and cache managers.
//! A fetcher is there to fetch the vulnerabilities from a source (e.g. NVD, GitHub).
//! A cache manager stores the vulnerabilities fetched by the fetcher.
//! The orchestrator drives both, shard by shard.

pub mod cache_managers;
pub mod fetchers;
pub mod orchestrator;
pub mod rate_limiter;
pub mod shutdown;

use clap::{builder::PossibleValue, ValueEnum};

/// This enum represents the source of the vulnerabilities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VulnSource {
    /// The CVEs are downloaded from the NVD.
    Nvd,
    /// The security advisories are downloaded from GitHub.
    Ghsa,
}

impl VulnSource {
    /// The prefix of the cache files when none is given.
    pub fn default_prefix(&self) -> &'static str {
        match self {
            VulnSource::Nvd => "nvdcve-",
            VulnSource::Ghsa => "ghsa-",
        }
    }
}

impl ValueEnum for VulnSource {
    /// Lists the variants available for clap
    fn value_variants<'a>() -> &'a [Self] {
        &[VulnSource::Nvd, VulnSource::Ghsa]
    }

    /// Map each value to a possible value in clap
    fn to_possible_value(&self) -> Option<PossibleValue> {
        match &self {
            VulnSource::Nvd => Some(PossibleValue::new("nvd")),
            VulnSource::Ghsa => Some(PossibleValue::new("ghsa")),
        }
    }
}
