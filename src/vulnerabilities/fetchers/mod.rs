//! The module fetchers defines the vulnerabilities fetchers.
//!
//! A fetcher is a [`PaginatedSource`]: the caller pulls one page at a time
//! until the source reports it has no more. Each source tracks its progress
//! in a [`FetchCursor`].

pub mod ghsa;
pub mod nvd;
pub mod templates;
pub mod windowed;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::errors::FetchError;
use crate::models::{latest, Page};

/// A common interface between all vulnerabilities fetchers.
pub trait PaginatedSource<R> {
    /// Whether another call to [`PaginatedSource::next`] may return records.
    /// Always false once a page failed.
    fn has_next(&self) -> bool;

    /// Fetches the next page. Each call sends exactly one upstream request,
    /// besides the follow-up requests a source needs to complete its records.
    fn next(&mut self) -> Result<Page<R>, FetchError>;

    /// The HTTP status of the last upstream call, 200 before the first one.
    fn last_status_code(&self) -> u16;

    /// The latest modification timestamp observed so far.
    fn last_updated(&self) -> Option<DateTime<Utc>>;

    /// Releases the source. Further calls to `next` fail.
    fn close(&mut self);
}

/// The states of a source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SourceState {
    /// No page has been requested yet.
    Idle,
    /// A page has been returned and the upstream has more.
    PageReady,
    /// Every page has been returned.
    Exhausted,
    /// A page failed; no further page is attempted.
    Failed,
}

/// The progress of a source through the upstream pages.
#[derive(Debug)]
pub struct FetchCursor {
    state: SourceState,
    /// Where the next page starts.
    pending_cursor: Option<String>,
    last_status: u16,
    last_updated: Option<DateTime<Utc>>,
    total_seen: u64,
    total_claimed: u64,
}

impl FetchCursor {
    /// Creates a cursor for a source that has not fetched anything.
    pub fn new() -> Self {
        FetchCursor {
            state: SourceState::Idle,
            pending_cursor: None,
            last_status: 200,
            last_updated: None,
            total_seen: 0,
            total_claimed: 0,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn has_next(&self) -> bool {
        if self.last_status != 200 {
            return false;
        }
        matches!(self.state, SourceState::Idle | SourceState::PageReady)
    }

    /// The cursor to request the next page with, `None` for the first page.
    pub fn pending_cursor(&self) -> Option<&str> {
        self.pending_cursor.as_deref()
    }

    pub fn last_status(&self) -> u16 {
        self.last_status
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen
    }

    pub fn total_claimed(&self) -> u64 {
        self.total_claimed
    }

    /// Fails with [`FetchError::NoMorePages`] unless a page may be fetched.
    pub fn ensure_next(&self) -> Result<(), FetchError> {
        if self.has_next() {
            Ok(())
        } else {
            Err(FetchError::NoMorePages)
        }
    }

    /// Records a successful page.
    pub fn record_page(
        &mut self,
        records: usize,
        next_cursor: Option<String>,
        total_claimed: u64,
        watermark: Option<DateTime<Utc>>,
    ) {
        self.last_status = 200;
        self.total_seen += records as u64;
        self.total_claimed = total_claimed;
        self.last_updated = latest(self.last_updated, watermark);
        self.pending_cursor = next_cursor;
        self.state = if self.pending_cursor.is_some() {
            SourceState::PageReady
        } else {
            if self.total_seen < self.total_claimed {
                warn!(
                    "Upstream claimed {} records but no further page after {}",
                    self.total_claimed, self.total_seen
                );
            }
            SourceState::Exhausted
        };
        debug!(
            "Page recorded: {}/{} records, state {:?}",
            self.total_seen, self.total_claimed, self.state
        );
    }

    /// Records a failed call. `status` is the HTTP status when the upstream
    /// answered, `None` otherwise.
    pub fn fail(&mut self, status: Option<u16>) {
        if let Some(status) = status {
            self.last_status = status;
        }
        self.pending_cursor = None;
        self.state = SourceState::Failed;
    }

    /// Marks the source as closed.
    pub fn close(&mut self) {
        if self.state != SourceState::Failed {
            self.state = SourceState::Exhausted;
        }
        self.pending_cursor = None;
    }
}

impl Default for FetchCursor {
    fn default() -> Self {
        Self::new()
    }
}
