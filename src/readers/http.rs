//! Fetch data over HTTP(S)
//!
//! The [`HttpReader`] sends the requests of the fetchers. Each request is an
//! asynchronous reqwest call, but the caller waits for its completion: the
//! fetchers are single-flight and the runtime only avoids blocking a thread
//! on socket I/O.

use futures::future::{select, Either};
use log::{debug, error, trace};
use reqwest::Client;
use tokio::runtime::Runtime;

use crate::errors::FetchError;
use crate::vulnerabilities::shutdown::ShutdownSignal;

/// The HTTP methods the fetchers need.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Represents a request a fetcher wants to send.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// The full URL, query string included.
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// A JSON body, only for POST requests.
    pub body: Option<String>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(url: &str) -> Self {
        HttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post_json(url: &str, body: String) -> Self {
        HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }

    /// Adds a header to the request.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Represents the response to an [`HttpRequest`].
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: &str) -> Self {
        HttpResponse {
            status,
            body: body.to_string(),
        }
    }
}

/// A common interface between the ways to send a request.
///
/// Implementations must give up with [`FetchError::Interrupted`] when the
/// shutdown signal fires.
pub trait HttpTransport: Send + Sync {
    /// Sends the request and waits for the whole response.
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// A reader used to send requests to the upstream APIs.
pub struct HttpReader {
    client: Client,
    runtime: Runtime,
    shutdown: ShutdownSignal,
}

impl HttpReader {
    /// Creates a new HttpReader.
    /// `threads` is a hint: one keeps everything on the calling thread.
    pub fn new(threads: usize, shutdown: ShutdownSignal) -> Result<Self, FetchError> {
        trace!("Running HttpReader::new()");
        let client = Client::builder()
            .user_agent(concat!("vulnmirror/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()?;

        let runtime = if threads > 1 {
            debug!("Using a multi-threaded runtime with {} workers", threads);
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(threads)
                .enable_all()
                .build()
        } else {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        }
        .map_err(|e| FetchError::Transport(format!("unable to start the HTTP runtime: {}", e)))?;

        Ok(HttpReader {
            client,
            runtime,
            shutdown,
        })
    }

    /// Sends one HTTP request and get the response.
    async fn http_request(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            error!("An error occured in the HTTP request to {}: {:?}", request.url, e);
            FetchError::from(e)
        })?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpTransport for HttpReader {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        trace!("Running HttpReader::execute() on {}", request.url);
        if self.shutdown.is_triggered() {
            return Err(FetchError::Interrupted);
        }
        self.runtime.block_on(async {
            let request_future = Box::pin(self.http_request(request));
            let cancelled = Box::pin(self.shutdown.cancelled());
            match select(request_future, cancelled).await {
                Either::Left((response, _)) => response,
                Either::Right(_) => {
                    debug!("Request to {} abandoned on shutdown", request.url);
                    Err(FetchError::Interrupted)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_carry_their_headers() {
        let request = HttpRequest::post_json("https://api.github.com/graphql", "{}".to_string())
            .with_header("Authorization", "bearer token");
        assert_eq!(HttpMethod::Post, request.method);
        assert_eq!(2, request.headers.len());
        assert_eq!(Some("{}".to_string()), request.body);
    }

    #[test]
    fn execute_refuses_to_start_after_shutdown() {
        let shutdown = ShutdownSignal::new();
        let reader = HttpReader::new(1, shutdown.clone()).unwrap();
        shutdown.trigger();
        let result = reader.execute(&HttpRequest::get("https://127.0.0.1:9/"));
        assert!(matches!(result, Err(FetchError::Interrupted)));
    }
}
