//! # Fetch
//!
//! Retrieve documents over HTTP with exponential backoff between attempts.
use std::time;

use http::StatusCode;
use reqwest::header;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::retry::RetryPolicy;

/// The reason a single fetch attempt failed.
#[derive(Error, Debug)]
pub enum FetchFailure {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("bad HTTP status code = {status}")]
    Status { status: StatusCode },
    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
}

/// A document could not be retrieved within the allowed number of attempts.
#[derive(Error, Debug)]
#[error("failed to download document from {url} after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub url: String,
    pub attempts: u32,
    #[source]
    pub cause: FetchFailure,
}

/// A successfully downloaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub body: String,
    /// The `ETag` response header with quotes removed.
    pub etag: Option<String>,
    /// How many attempts it took to download the document.
    pub attempts: u32,
}

/// Downloads documents, retrying failures according to a `RetryPolicy`.
#[derive(Clone)]
pub struct DocumentFetcher {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl DocumentFetcher {
    pub fn new(request_timeout: time::Duration, retry_policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("Photo Registry Feeder")
            .timeout(request_timeout)
            .build()?;

        Ok(Self::with_client(client, retry_policy))
    }

    pub fn with_client(client: reqwest::Client, retry_policy: RetryPolicy) -> Self {
        Self {
            client,
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Download `url`, making at most `retry_limit` attempts.
    ///
    /// Transport errors and any status other than 200 are retried alike. A `retry_limit`
    /// of 0 is treated as 1.
    pub async fn fetch(&self, url: &str, retry_limit: u32) -> Result<FetchedDocument, FetchError> {
        let max_attempts = retry_limit.max(1);
        let started = tokio::time::Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            metrics::counter!("document_fetch_attempts_total").increment(1);

            match self.attempt(url).await {
                Ok((body, etag)) => {
                    info!(
                        url,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "successfully downloaded document"
                    );
                    return Ok(FetchedDocument {
                        body,
                        etag,
                        attempts,
                    });
                }
                Err(cause) if attempts < max_attempts => {
                    let delay = self.retry_policy.retry_interval(attempts);
                    warn!(
                        url,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "document download failed, retrying: {}",
                        cause
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(cause) => {
                    error!(url, attempts, "error downloading document: {}", cause);
                    metrics::counter!("document_fetch_failures_total").increment(1);
                    return Err(FetchError {
                        url: url.to_owned(),
                        attempts,
                        cause,
                    });
                }
            }
        }
    }

    async fn attempt(&self, url: &str) -> Result<(String, Option<String>), FetchFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchFailure::Request)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchFailure::Status { status });
        }

        let etag = parse_etag_header(response.headers());
        if etag.is_none() {
            warn!(url, "response is missing an ETag header");
        }

        let body = response.text().await.map_err(FetchFailure::Body)?;

        Ok((body, etag))
    }
}

/// Read the `ETag` header, dropping every quote character.
fn parse_etag_header(header_map: &header::HeaderMap) -> Option<String> {
    let value = header_map.get(header::ETAG)?.to_str().ok()?;

    Some(value.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{http::HeaderMap, routing::get, Router};
    use httpmock::prelude::*;

    use super::*;

    fn fast_fetcher() -> DocumentFetcher {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(1)).provide();
        DocumentFetcher::new(time::Duration::from_secs(5), retry_policy).unwrap()
    }

    /// Serve `/appl`, answering 503 for the first `failures` requests and 200 afterwards.
    async fn flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let app = Router::new().route(
            "/appl",
            get(move || {
                let counter = counter.clone();
                async move {
                    let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let mut headers = HeaderMap::new();
                    if hit <= failures {
                        return (StatusCode::SERVICE_UNAVAILABLE, headers, String::new());
                    }
                    headers.insert(
                        header::ETAG,
                        format!("\"etag-{}\"", hit).parse().unwrap(),
                    );
                    (StatusCode::OK, headers, format!("<doc attempt=\"{}\"/>", hit))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/appl", address), hits)
    }

    #[test]
    fn test_parse_etag_header() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(parse_etag_header(&headers), None);

        headers.insert(header::ETAG, "\"abc123\"".parse().unwrap());
        assert_eq!(parse_etag_header(&headers), Some("abc123".to_owned()));

        headers.insert(header::ETAG, "plain".parse().unwrap());
        assert_eq!(parse_etag_header(&headers), Some("plain".to_owned()));
    }

    #[tokio::test]
    async fn test_fetch_succeeds_after_transient_failures() {
        let (url, hits) = flaky_server(2).await;

        let document = fast_fetcher()
            .fetch(&url, 3)
            .await
            .expect("fetch should succeed on the third attempt");

        assert_eq!(document.attempts, 3);
        assert_eq!(document.etag, Some("etag-3".to_owned()));
        assert_eq!(document.body, "<doc attempt=\"3\"/>");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_retry_limit() {
        let (url, hits) = flaky_server(10).await;

        let error = fast_fetcher()
            .fetch(&url, 3)
            .await
            .expect_err("fetch should fail");

        assert_eq!(error.attempts, 3);
        assert!(matches!(
            error.cause,
            FetchFailure::Status {
                status: StatusCode::SERVICE_UNAVAILABLE
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_limit_of_one_makes_a_single_attempt() {
        let (url, hits) = flaky_server(1).await;

        let error = fast_fetcher().fetch(&url, 1).await.expect_err("fetch should fail");

        assert_eq!(error.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_limit_of_zero_still_attempts_once() {
        let (url, hits) = flaky_server(0).await;

        let document = fast_fetcher().fetch(&url, 0).await.expect("fetch should succeed");

        assert_eq!(document.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_success_statuses_are_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;

        let error = fast_fetcher()
            .fetch(&server.url("/missing"), 2)
            .await
            .expect_err("fetch should fail");

        assert_eq!(error.attempts, 2);
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        // Nothing listens on this port once the listener is dropped.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let error = fast_fetcher()
            .fetch(&format!("http://{}/appl", address), 2)
            .await
            .expect_err("fetch should fail");

        assert_eq!(error.attempts, 2);
        assert!(matches!(error.cause, FetchFailure::Request(_)));
    }

    #[tokio::test]
    async fn test_backoff_between_attempts_doubles() {
        let (url, _) = flaky_server(10).await;
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(40)).provide();
        let fetcher = DocumentFetcher::new(time::Duration::from_secs(5), retry_policy).unwrap();

        let started = std::time::Instant::now();
        let error = fetcher.fetch(&url, 3).await.expect_err("fetch should fail");

        // Two waits between three attempts: 40ms then 80ms.
        assert_eq!(error.attempts, 3);
        assert!(started.elapsed() >= time::Duration::from_millis(120));
    }
}
