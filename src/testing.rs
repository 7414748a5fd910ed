//! Helpers shared by the unit tests.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::errors::FetchError;
use crate::models::advisory::{Connection, PageInfo, SecurityAdvisory};
use crate::models::cve::{nvd_timestamp, Cve, CveItem};
use crate::readers::http::{HttpRequest, HttpResponse, HttpTransport};

/// A transport answering with canned responses, in order, and keeping the
/// requests it received.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a response.
    pub fn respond(&self, status: u16, body: &str) {
        self.responses
            .lock()
            .push_back(Ok(HttpResponse::new(status, body)));
    }

    /// Queues a transport error.
    pub fn fail(&self, error: FetchError) {
        self.responses.lock().push_back(Err(error));
    }

    /// The requests received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// How many queued responses were not consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Transport("no scripted response".to_string())))
    }
}

/// Builds a CVE record. Timestamps use the NVD format.
pub fn cve_item(id: &str, published: &str, last_modified: &str) -> CveItem {
    let mut other = Map::new();
    other.insert(
        "descriptions".to_string(),
        json!([{"lang": "en", "value": format!("Description of {}", id)}]),
    );
    CveItem {
        cve: Cve {
            id: id.to_string(),
            source_identifier: Some("cve@mitre.org".to_string()),
            published: nvd_timestamp::parse(published).unwrap(),
            last_modified: nvd_timestamp::parse(last_modified).unwrap(),
            vuln_status: Some("Analyzed".to_string()),
            other,
        },
    }
}

/// Builds an NVD API response body.
pub fn nvd_body(start_index: u64, total: u64, timestamp: &str, items: &[CveItem]) -> String {
    json!({
        "resultsPerPage": items.len(),
        "startIndex": start_index,
        "totalResults": total,
        "format": "NVD_CVE",
        "version": "2.0",
        "timestamp": timestamp,
        "vulnerabilities": items,
    })
    .to_string()
}

/// Builds a connection with `edges` edges out of `total`.
pub fn connection(prefix: &str, edges: usize, total: u64, has_next_page: bool) -> Connection {
    Connection {
        total_count: total,
        page_info: PageInfo {
            has_next_page,
            end_cursor: Some(format!("{}-cursor-{}", prefix, edges)),
        },
        edges: (0..edges)
            .map(|i| json!({"node": {"id": format!("{}-{}", prefix, i)}}))
            .collect(),
    }
}

/// Builds an advisory with complete sub-lists.
pub fn advisory(id: &str, published: &str, updated: &str) -> SecurityAdvisory {
    let mut other = Map::new();
    other.insert("summary".to_string(), Value::String(format!("Summary of {}", id)));
    SecurityAdvisory {
        ghsa_id: id.to_string(),
        published_at: published.parse().unwrap(),
        updated_at: updated.parse().unwrap(),
        cwes: connection("cwe", 1, 1, false),
        vulnerabilities: connection("vuln", 1, 1, false),
        other,
    }
}

/// Builds a GraphQL advisories page body.
pub fn advisories_body(total: u64, has_next_page: bool, cursor: &str, nodes: &[SecurityAdvisory]) -> String {
    json!({
        "data": {
            "securityAdvisories": {
                "totalCount": total,
                "pageInfo": {"hasNextPage": has_next_page, "endCursor": cursor},
                "nodes": nodes,
            }
        }
    })
    .to_string()
}
