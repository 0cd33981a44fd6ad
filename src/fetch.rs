//! Bounded download of enrollment audio blobs.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout downloading audio")]
    Timeout,
    #[error("HTTP error downloading audio: {0}")]
    HttpStatus(u16),
    #[error("downloaded audio file is empty")]
    EmptyDownload,
    #[error("failed to download audio: {0}")]
    Transport(String),
}

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Single-GET fetcher with a hard timeout. Retry policy belongs to callers.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

#[async_trait]
impl BlobFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        tracing::info!("Downloading audio from {}", url);
        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(err.to_string())
            }
        })?;
        tracing::info!("Downloaded {} bytes of audio data", body.len());
        if body.is_empty() {
            return Err(FetchError::EmptyDownload);
        }
        Ok(body)
    }
}
