//! Batched feed downloading.
//!
//! One shared client fetches every request in a batch concurrently, each
//! under the same wall-clock timeout and body-size cap. The parser only ever
//! sees bytes already buffered here; no URL is forwarded to any parsing
//! path, so a malicious document cannot make the parser fetch anything.
//!
//! There is deliberately no retry logic at this level: the worker owns the
//! retry/backoff policy through the job queue.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use uuid::Uuid;

use crate::feed::parser::{parse_feed, FeedContent, ParseError};

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, protocol).
    #[error("request failed: {0}")]
    Network(reqwest::Error),
    /// The request exceeded the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// HTTP response with status >= 400.
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the configured size cap.
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// Why a single feed in a batch yielded no content.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// One feed to fetch within a batch. `request_id` correlates the outcome
/// back to the caller's bookkeeping; `published_since` is the feed's stored
/// watermark, used to drop items already ingested on earlier refreshes.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub request_id: Uuid,
    pub url: String,
    pub published_since: Option<i64>,
}

/// Shared HTTP client with the batch limits baked in.
#[derive(Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    max_body_size: usize,
}

impl FeedFetcher {
    /// `timeout` is the total per-request deadline (connect + read);
    /// `max_body_size` caps each downloaded body.
    pub fn new(timeout: Duration, max_body_size: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_body_size,
        })
    }

    /// Fetch and parse every request concurrently. The result maps each
    /// request id to its outcome; one slow or hostile URL can cost at most
    /// the client timeout, never the whole tick.
    pub async fn fetch_batch(
        &self,
        requests: Vec<FetchRequest>,
    ) -> HashMap<Uuid, Result<FeedContent, FeedError>> {
        let concurrency = requests.len().max(1);
        stream::iter(requests)
            .map(|request| async move {
                let outcome = self.fetch_one(&request).await;
                if let Err(err) = &outcome {
                    tracing::warn!(url = %request.url, error = %err, "feed fetch failed");
                }
                (request.request_id, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    async fn fetch_one(&self, request: &FetchRequest) -> Result<FeedContent, FeedError> {
        let bytes = self.download(&request.url).await?;
        // parse strictly from the in-memory buffer
        let content = parse_feed(&bytes, request.published_since)?;
        Ok(content)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        // Fast path: a Content-Length over the cap fails before any download
        if let Some(length) = response.content_length() {
            if length as usize > self.max_body_size {
                return Err(FetchError::TooLarge {
                    limit: self.max_body_size,
                });
            }
        }

        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(FetchError::from)?;
            if bytes.len().saturating_add(chunk.len()) > self.max_body_size {
                return Err(FetchError::TooLarge {
                    limit: self.max_body_size,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(bytes)
    }
}
