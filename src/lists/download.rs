//! Source fetching for the list cache.
//!
//! A [`Downloader`] fetches one source at a time: `http`/`https` links go
//! through a shared reqwest client with conditional-request support, anything
//! else is treated as a local file path (optionally `file://` prefixed).
//!
//! The downloader owns the process-lifetime ETag map. When an ETag is cached
//! for a URL, requests carry `If-None-Match` / `If-Modified-Since`; a `304`
//! reply reports [`FetchOutcome::Unchanged`] so the caller keeps its prior
//! entries.

use reqwest::header::{DATE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Conditional-request state for one URL, taken from the `ETag` and `Date`
/// response headers of the last `200`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Etag {
    pub key: String,
    pub date: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout or temporary network error: {0}")]
    Transient(#[source] reqwest::Error),
    #[error("couldn't download url, got status code {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Http(reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Transient failures keep the prior cache entries; everything else
    /// replaces them with an empty vector.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// Fresh body to parse.
    Fetched(String),
    /// HTTP 304: the cached entries are still current.
    Unchanged,
}

pub struct Downloader {
    client: reqwest::Client,
    etags: Mutex<HashMap<String, Etag>>,
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            etags: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches one source. Links starting with `http` are downloaded, the
    /// rest are read from the filesystem.
    pub async fn fetch(&self, link: &str) -> Result<FetchOutcome, FetchError> {
        if link.starts_with("http") {
            self.download(link).await
        } else {
            self.read_file(link).await
        }
    }

    async fn download(&self, link: &str) -> Result<FetchOutcome, FetchError> {
        info!(link, "starting download");

        let mut attempt = 1;

        loop {
            let mut request = self.client.get(link);
            let cached = self.etags.lock().unwrap().get(link).cloned();
            if let Some(etag) = cached {
                request = request
                    .header(IF_NONE_MATCH, etag.key)
                    .header(IF_MODIFIED_SINCE, etag.date);
            }

            match request.send().await {
                Ok(response) => {
                    if response.status() == StatusCode::NOT_MODIFIED {
                        info!(link, "not modified");
                        return Ok(FetchOutcome::Unchanged);
                    }
                    if response.status() == StatusCode::OK {
                        self.update_etag(link, &response);
                        let body = response.text().await.map_err(FetchError::Http)?;
                        return Ok(FetchOutcome::Fetched(body));
                    }
                    return Err(FetchError::Status(response.status()));
                }
                Err(err) if is_temporary(&err) && attempt < DOWNLOAD_ATTEMPTS => {
                    warn!(link, attempt, error = %err, "temporary network error / timeout occurred, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) if is_temporary(&err) => return Err(FetchError::Transient(err)),
                Err(err) => return Err(FetchError::Http(err)),
            }
        }
    }

    // Missing ETag or Date headers are ignored; both are needed for the
    // conditional request.
    fn update_etag(&self, link: &str, response: &reqwest::Response) {
        let key = response.headers().get(ETAG).and_then(|v| v.to_str().ok());
        let date = response.headers().get(DATE).and_then(|v| v.to_str().ok());
        if let (Some(key), Some(date)) = (key, date) {
            self.etags.lock().unwrap().insert(
                link.to_string(),
                Etag {
                    key: key.to_string(),
                    date: date.to_string(),
                },
            );
        }
    }

    async fn read_file(&self, link: &str) -> Result<FetchOutcome, FetchError> {
        let path = link.strip_prefix("file://").unwrap_or(link);
        info!(file = path, "starting processing of file");
        let body = tokio::fs::read_to_string(path).await?;
        Ok(FetchOutcome::Fetched(body))
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_temporary(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
