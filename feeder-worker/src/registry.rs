//! Clients of the photo hash and registration services.
use async_trait::async_trait;
use serde_derive::Serialize;
use tracing::debug;

use crate::error::DownstreamError;

/// Computes a perceptual hash of the image behind a URL.
#[async_trait]
pub trait HashService: Send + Sync {
    async fn photo_hash(&self, url: &str) -> Result<String, DownstreamError>;
}

/// Records a (hash, record) pair and returns the transaction acknowledgment id.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn register(&self, photo_hash: &str, record: &str) -> Result<String, DownstreamError>;
}

#[derive(Serialize)]
struct HashRequest<'a> {
    url: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest<'a> {
    photo_hash: &'a str,
    record: &'a str,
}

#[derive(Clone)]
pub struct HttpHashService {
    client: reqwest::Client,
    url: String,
}

impl HttpHashService {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl HashService for HttpHashService {
    async fn photo_hash(&self, url: &str) -> Result<String, DownstreamError> {
        let hash = post_json(&self.client, &self.url, &HashRequest { url }).await?;
        debug!(url, "computed photo hash");

        Ok(hash)
    }
}

#[derive(Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    url: String,
}

impl HttpLedger {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn register(&self, photo_hash: &str, record: &str) -> Result<String, DownstreamError> {
        post_json(
            &self.client,
            &self.url,
            &RegistrationRequest { photo_hash, record },
        )
        .await
    }
}

/// POST `body` as JSON and return the response text. Any status outside 2xx is an error.
async fn post_json<T: serde::Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
) -> Result<String, DownstreamError> {
    let request_error = |error| DownstreamError::RequestError {
        url: url.to_owned(),
        error,
    };

    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(request_error)?;

    let status = response.status();
    let text = response.text().await.map_err(request_error)?;

    if !status.is_success() {
        return Err(DownstreamError::StatusError {
            url: url.to_owned(),
            status,
            body: text,
        });
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_hash_service_posts_url() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hash")
                    .json_body(json!({"url": "http://mapi/abc123/preview/preview.jpg"}));
                then.status(200).body("f00dfeed");
            })
            .await;

        let service = HttpHashService::new(reqwest::Client::new(), &server.url("/hash"));
        let hash = service
            .photo_hash("http://mapi/abc123/preview/preview.jpg")
            .await
            .unwrap();

        assert_eq!(hash, "f00dfeed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ledger_posts_hash_and_record() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/register").json_body(json!({
                    "photoHash": "f00dfeed",
                    "record": "{\"id\":\"abc123\"}",
                }));
                then.status(201).body("tx-1");
            })
            .await;

        let ledger = HttpLedger::new(reqwest::Client::new(), &server.url("/register"));
        let transaction = ledger
            .register("f00dfeed", r#"{"id":"abc123"}"#)
            .await
            .unwrap();

        assert_eq!(transaction, "tx-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/register");
                then.status(500).body("ledger unavailable");
            })
            .await;

        let ledger = HttpLedger::new(reqwest::Client::new(), &server.url("/register"));
        let error = ledger.register("f00dfeed", "{}").await.unwrap_err();

        match error {
            DownstreamError::StatusError { status, body, .. } => {
                assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "ledger unavailable");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
