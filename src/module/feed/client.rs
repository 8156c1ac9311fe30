//! Feed downloads with bounded retries

use crate::library::BoxedError;
use async_trait::async_trait;
use log::warn;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Base delay which is doubled on every failed attempt
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Provider of raw feed bytes
///
/// Abstracting the download allows collection logic to be exercised against
/// in-memory sources.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetches the current content of the feed
    async fn fetch(&self) -> Result<Vec<u8>, BoxedError>;
}

/// Download gave up after exhausting its retry budget
#[derive(Debug, Error)]
#[error("feed download failed after {attempts} attempts")]
pub struct DownloadError {
    attempts: u32,
    #[source]
    source: reqwest::Error,
}

/// HTTP backed [`FeedSource`] with a per-attempt timeout and retries
pub struct FeedClient {
    http: reqwest::Client,
    url: String,
    retries: u32,
}

impl FeedClient {
    /// Creates a client bound to the given URL
    pub fn new(url: impl Into<String>, timeout: Duration, retries: u32) -> Result<Self, BoxedError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url: url.into(),
            retries,
        })
    }

    async fn attempt(&self) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.http.get(&self.url).send().await?.error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}

/// Exponentially growing delay with up to 50% random jitter on top
fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..=exponential.as_millis() as u64 / 2);

    exponential + Duration::from_millis(jitter)
}

#[async_trait]
impl FeedSource for FeedClient {
    async fn fetch(&self) -> Result<Vec<u8>, BoxedError> {
        let mut attempt = 0;

        loop {
            match self.attempt().await {
                Ok(body) => return Ok(body),
                Err(error) if attempt < self.retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "Download of '{}' failed ({}), retrying in {:?}",
                        self.url, error, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(DownloadError {
                        attempts: attempt + 1,
                        source,
                    }
                    .into())
                }
            }
        }
    }
}
