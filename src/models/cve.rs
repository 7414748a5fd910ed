//! Records of the NVD CVE API 2.0
//!
//! Only the fields the mirror reasons about are typed. Everything else is
//! kept verbatim in `other` so a cached record carries the full upstream
//! document.
//! https://nvd.nist.gov/developers/vulnerabilities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Record;

/// Represents the main JSON object returned by the NVD CVE API.
#[derive(Debug, Deserialize)]
pub struct CveApiResponse {
    /// The number of results by page.
    #[serde(rename = "resultsPerPage")]
    pub results_per_page: u64,
    /// The start index.
    #[serde(rename = "startIndex")]
    pub start_index: u64,
    /// The number of CVEs matching the query.
    #[serde(rename = "totalResults")]
    pub total_results: u64,
    /// The format.
    /// Example: NVD_CVE
    pub format: String,
    /// The version.
    /// Example: 2.0
    pub version: String,
    /// When the response was generated.
    #[serde(with = "nvd_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// The list of vulnerabilities.
    #[serde(default)]
    pub vulnerabilities: Vec<CveItem>,
}

/// Represents a vulnerability returned as part of the CveApiResponse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveItem {
    /// The CVE.
    pub cve: Cve,
}

/// Represents a CVE as returned as part of the CveItem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cve {
    /// The CVE identifier.
    /// Example: CVE-2012-6708
    pub id: String,
    /// The source identifier.
    /// Example: cve@mitre.org
    #[serde(
        rename = "sourceIdentifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_identifier: Option<String>,
    /// When the CVE was published.
    /// Example: 2018-01-18T23:29:00.213
    #[serde(with = "nvd_timestamp")]
    pub published: DateTime<Utc>,
    /// When the CVE was modified.
    /// Example: 2023-11-07T02:13:33.290
    #[serde(rename = "lastModified", with = "nvd_timestamp")]
    pub last_modified: DateTime<Utc>,
    /// The status of the vulnerability.
    /// Example: Modified
    #[serde(rename = "vulnStatus", default, skip_serializing_if = "Option::is_none")]
    pub vuln_status: Option<String>,
    /// Descriptions, metrics, weaknesses, configurations, references...
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Record for CveItem {
    const FORMAT: &'static str = "NVD_CVE";
    const VERSION: &'static str = "2.0";

    fn id(&self) -> &str {
        &self.cve.id
    }

    fn published(&self) -> DateTime<Utc> {
        self.cve.published
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.cve.last_modified
    }
}

/// (De)serializes the NVD timestamps, which carry milliseconds but no
/// offset. They are UTC.
pub mod nvd_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(de::Error::custom)
    }

    /// Formats a timestamp the way the NVD does.
    pub fn format(value: &DateTime<Utc>) -> String {
        value.format(FORMAT).to_string()
    }

    /// Parses a timestamp with or without an explicit offset.
    pub fn parse(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        if let Ok(with_offset) = DateTime::parse_from_rfc3339(text) {
            return Ok(with_offset.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc())
    }
}
