//! This module implements a vulnerability fetcher which downloads
//! the security advisories from the GitHub GraphQL API.
//! https://docs.github.com/en/graphql/reference/queries#securityadvisories
//!
//! An advisory page embeds the first CWEs and vulnerable packages of each
//! advisory. When an advisory has more, the remaining ones are requested
//! before the page is handed out, so every returned advisory is complete.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, trace, warn};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::templates::{QueryTemplates, TemplateName, Variables};
use super::{FetchCursor, PaginatedSource};
use crate::errors::FetchError;
use crate::models::advisory::{
    AdvisoriesData, AdvisoryData, AdvisorySubList, Connection, GraphQlResponse, SecurityAdvisory,
};
use crate::models::{latest, Page};
use crate::readers::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::vulnerabilities::rate_limiter::RateLimiter;
use crate::vulnerabilities::shutdown::ShutdownSignal;

/// The public endpoint of the GraphQL API.
pub const GITHUB_GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";

/// The sub-lists of an advisory that may need more requests.
#[derive(Clone, Copy, Debug, PartialEq)]
enum SubList {
    Cwes,
    Vulnerabilities,
}

impl SubList {
    fn template(&self) -> TemplateName {
        match self {
            SubList::Cwes => TemplateName::AdvisoryCwes,
            SubList::Vulnerabilities => TemplateName::AdvisoryVulnerabilities,
        }
    }

    fn pick(&self, data: AdvisorySubList) -> Option<Connection> {
        match self {
            SubList::Cwes => data.cwes,
            SubList::Vulnerabilities => data.vulnerabilities,
        }
    }
}

/// The filters of an advisories query.
#[derive(Clone, Debug)]
pub struct AdvisoryQuery {
    endpoint: String,
    token: String,
    published_since: Option<DateTime<Utc>>,
    updated_since: Option<DateTime<Utc>>,
    published_until: Option<DateTime<Utc>>,
}

impl AdvisoryQuery {
    /// Creates a query on the public endpoint.
    pub fn new(token: &str) -> Self {
        AdvisoryQuery {
            endpoint: GITHUB_GRAPHQL_ENDPOINT.to_string(),
            token: token.to_string(),
            published_since: None,
            updated_since: None,
            published_until: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_published_since(mut self, published_since: Option<DateTime<Utc>>) -> Self {
        self.published_since = published_since;
        self
    }

    pub fn with_updated_since(mut self, updated_since: Option<DateTime<Utc>>) -> Self {
        self.updated_since = updated_since;
        self
    }

    /// The API has no upper bound on the publication date. Advisories are
    /// ordered by publication date, so paging stops at the first one
    /// published after this date.
    pub fn with_published_until(mut self, published_until: Option<DateTime<Utc>>) -> Self {
        self.published_until = published_until;
        self
    }

    fn variables(&self, after: Option<&str>) -> Variables {
        let mut variables = Variables::new();
        if let Some(date) = &self.published_since {
            variables.insert("publishedSince", format_date(date));
        }
        if let Some(date) = &self.updated_since {
            variables.insert("updatedSince", format_date(date));
        }
        if let Some(after) = after {
            variables.insert("after", after.to_string());
        }
        variables
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Pages through the advisories matching an [`AdvisoryQuery`].
pub struct GraphQlAdvisorySource {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
    query: AdvisoryQuery,
    templates: QueryTemplates,
    cursor: FetchCursor,
}

impl GraphQlAdvisorySource {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownSignal,
        query: AdvisoryQuery,
    ) -> Self {
        GraphQlAdvisorySource {
            transport,
            limiter,
            shutdown,
            query,
            templates: QueryTemplates::new(),
            cursor: FetchCursor::new(),
        }
    }

    /// The number of advisories GitHub claims to match the query.
    pub fn total_available(&self) -> u64 {
        self.cursor.total_claimed()
    }

    /// Sends one query. Any status other than 200 is an error.
    fn send(&self, template: TemplateName, variables: &Variables) -> Result<HttpResponse, FetchError> {
        let query = self.templates.render(template, variables);
        let body = json!({ "query": query }).to_string();
        let request = HttpRequest::post_json(&self.query.endpoint, body)
            .with_header("Authorization", &format!("bearer {}", self.query.token));

        self.limiter.acquire(&self.shutdown)?;
        debug!("Querying {:?} on {}", template, self.query.endpoint);
        let response = self.transport.execute(&request)?;
        if response.status != 200 {
            error!("Invalid HTTP response code from GitHub: {}", response.status);
            error!("{}", response.body);
            return Err(FetchError::Rejected {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }

    /// Requests the missing pages of a sub-list of an advisory.
    fn complete(&self, ghsa_id: &str, connection: &mut Connection, list: SubList) -> Result<(), FetchError> {
        while connection.is_incomplete() {
            let mut variables = Variables::new();
            variables.insert("ghsaId", ghsa_id.to_string());
            if let Some(after) = &connection.page_info.end_cursor {
                variables.insert("after", after.clone());
            }
            let response = self.send(list.template(), &variables)?;
            let data: AdvisoryData = decode(&response.body)?;
            match data.security_advisory.and_then(|a| list.pick(a)) {
                Some(next) if !next.edges.is_empty() => connection.splice(next),
                _ => {
                    warn!(
                        "{}: GitHub announced {} {:?} but returned {}",
                        ghsa_id,
                        connection.total_count,
                        list,
                        connection.edges.len()
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Completes every sub-list of an advisory.
    fn ensure_sub_pages(&self, advisory: &mut SecurityAdvisory) -> Result<(), FetchError> {
        self.complete(&advisory.ghsa_id, &mut advisory.cwes, SubList::Cwes)?;
        self.complete(
            &advisory.ghsa_id,
            &mut advisory.vulnerabilities,
            SubList::Vulnerabilities,
        )
    }

    /// Moves to the failed state and hands the error back.
    fn fail<T>(&mut self, error: FetchError) -> Result<T, FetchError> {
        let status = match &error {
            FetchError::Rejected { status, .. } => Some(*status),
            _ => None,
        };
        self.cursor.fail(status);
        Err(error)
    }
}

/// Extracts the data of a GraphQL response, failing on reported errors.
fn decode<T: DeserializeOwned>(body: &str) -> Result<T, FetchError> {
    let response: GraphQlResponse<T> = serde_json::from_str(body)?;
    if !response.errors.is_empty() {
        let messages: Vec<String> = response.errors.into_iter().map(|e| e.message).collect();
        error!("GitHub reported errors: {}", messages.join("; "));
        return Err(FetchError::GraphQl(messages.join("; ")));
    }
    response
        .data
        .ok_or_else(|| FetchError::GraphQl("the response carries no data".to_string()))
}

impl PaginatedSource<SecurityAdvisory> for GraphQlAdvisorySource {
    fn has_next(&self) -> bool {
        self.cursor.has_next()
    }

    fn next(&mut self) -> Result<Page<SecurityAdvisory>, FetchError> {
        trace!("Running GraphQlAdvisorySource::next()");
        self.cursor.ensure_next()?;
        let variables = self.query.variables(self.cursor.pending_cursor());

        let response = match self.send(TemplateName::Advisories, &variables) {
            Ok(r) => r,
            Err(e) => return self.fail(e),
        };
        let data: AdvisoriesData = match decode(&response.body) {
            Ok(d) => d,
            Err(e) => return self.fail(e),
        };
        let list = data.security_advisories;
        let returned = list.nodes.len();

        let mut records = Vec::with_capacity(returned);
        let mut watermark = None;
        let mut beyond_bound = false;
        for mut advisory in list.nodes {
            if self
                .query
                .published_until
                .is_some_and(|until| advisory.published_at > until)
            {
                beyond_bound = true;
                break;
            }
            if let Err(e) = self.ensure_sub_pages(&mut advisory) {
                return self.fail(e);
            }
            watermark = latest(watermark, Some(advisory.updated_at));
            records.push(advisory);
        }

        let seen = self.cursor.total_seen() + records.len() as u64;
        let (next_cursor, total_claimed) = if beyond_bound {
            debug!("Reached the advisories published after the requested range");
            (None, seen)
        } else if returned > 0 && (list.page_info.has_next_page || seen < list.total_count) {
            (list.page_info.end_cursor, list.total_count)
        } else {
            (None, list.total_count)
        };

        self.cursor
            .record_page(records.len(), next_cursor.clone(), total_claimed, watermark);
        Ok(Page {
            records,
            status: response.status,
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
        self.cursor.close();
    }
}
