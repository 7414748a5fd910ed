//! Error types shared by the fetchers, the cache and the orchestrator.

use std::path::PathBuf;

/// Errors raised while pulling pages from an upstream feed.
///
/// Every variant except [`FetchError::NoMorePages`] moves the source that
/// raised it into its terminal failed state.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The shutdown signal fired while waiting for a permit or a response.
    #[error("interrupted while waiting on the upstream")]
    Interrupted,

    /// Connection, TLS or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream answered with a status other than 200.
    #[error("upstream rejected the request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// A 200 response carrying GraphQL errors instead of data.
    #[error("GraphQL error: {0}")]
    GraphQl(String),

    /// The response body does not match the expected schema.
    #[error("unable to deserialize the upstream response: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// `next()` was called on a source that has no further pages.
    #[error("the source has no more pages")]
    NoMorePages,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(err.to_string())
    }
}

/// Errors raised while reading or writing the on-disk cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed cache artifact {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed metadata in {path}: {line}")]
    Metadata { path: PathBuf, line: String },
}

impl CacheError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort a whole refresh run.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Writing the cache failed; a corrupted cache is worse than a stale one.
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("every shard failed to refresh")]
    AllShardsFailed,

    #[error("refresh interrupted before any shard succeeded")]
    Interrupted,
}
