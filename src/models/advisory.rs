//! Records of the GitHub security advisories GraphQL API
//!
//! An advisory embeds two paginated sub-lists, its CWEs and its vulnerable
//! packages. They are kept as [`Connection`]s so the fetcher can complete
//! them when they exceed one page.
//! https://docs.github.com/en/graphql/reference/objects#securityadvisory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Record;

/// Represents a security advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAdvisory {
    /// The GitHub advisory identifier.
    /// Example: GHSA-rv95-896h-c2vc
    #[serde(rename = "ghsaId")]
    pub ghsa_id: String,
    /// When the advisory was published.
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
    /// When the advisory was last updated.
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// The CWEs associated with the advisory.
    pub cwes: Connection,
    /// The vulnerable packages and version ranges.
    pub vulnerabilities: Connection,
    /// Summary, severity, identifiers, references...
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Record for SecurityAdvisory {
    const FORMAT: &'static str = "GHSA";
    const VERSION: &'static str = "1.0";

    fn id(&self) -> &str {
        &self.ghsa_id
    }

    fn published(&self) -> DateTime<Utc> {
        self.published_at
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// A GraphQL connection embedded in an advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// How many edges exist in total.
    #[serde(rename = "totalCount")]
    pub total_count: u64,
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    /// The edges, kept as upstream documents.
    #[serde(default)]
    pub edges: Vec<Value>,
}

impl Connection {
    /// Whether the connection holds fewer edges than the upstream has.
    pub fn is_incomplete(&self) -> bool {
        (self.edges.len() as u64) < self.total_count
    }

    /// Appends the edges of a following page.
    pub fn splice(&mut self, next: Connection) {
        self.edges.extend(next.edges);
        self.total_count = next.total_count;
        if next.page_info.end_cursor.is_some() {
            self.page_info.end_cursor = next.page_info.end_cursor;
        }
        self.page_info.has_next_page = next.page_info.has_next_page;
    }
}

/// The cursor information of a GraphQL connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
}

/// The envelope of every GraphQL response.
#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

/// An error reported in a GraphQL response.
#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message: String,
}

/// The data of an advisories list query.
#[derive(Debug, Deserialize)]
pub struct AdvisoriesData {
    #[serde(rename = "securityAdvisories")]
    pub security_advisories: AdvisoryList,
}

/// One page of advisories.
#[derive(Debug, Deserialize)]
pub struct AdvisoryList {
    #[serde(rename = "totalCount")]
    pub total_count: u64,
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    #[serde(default)]
    pub nodes: Vec<SecurityAdvisory>,
}

/// The data of a single advisory query, used to page through a sub-list.
#[derive(Debug, Deserialize)]
pub struct AdvisoryData {
    #[serde(rename = "securityAdvisory")]
    pub security_advisory: Option<AdvisorySubList>,
}

/// The sub-lists returned by a single advisory query. Only the requested
/// one is present.
#[derive(Debug, Deserialize)]
pub struct AdvisorySubList {
    pub cwes: Option<Connection>,
    pub vulnerabilities: Option<Connection>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splice_appends_edges_and_closes_the_page_info() {
        let mut first = Connection {
            total_count: 3,
            page_info: PageInfo {
                has_next_page: true,
                end_cursor: Some("c2".to_string()),
            },
            edges: vec![json!({"node": 1}), json!({"node": 2})],
        };
        assert!(first.is_incomplete());
        first.splice(Connection {
            total_count: 3,
            page_info: PageInfo {
                has_next_page: false,
                end_cursor: Some("c3".to_string()),
            },
            edges: vec![json!({"node": 3})],
        });
        assert_eq!(3, first.edges.len());
        assert_eq!(Some("c3".to_string()), first.page_info.end_cursor);
        assert!(!first.is_incomplete());
    }

    #[test]
    fn graphql_errors_are_parsed() {
        let body = r#"{"data": null, "errors": [{"message": "Bad credentials"}]}"#;
        let response: GraphQlResponse<AdvisoriesData> = serde_json::from_str(body).unwrap();
        assert!(response.data.is_none());
        assert_eq!("Bad credentials", response.errors[0].message);
    }
}
