//! HTTP asset fetching
//!
//! The fetcher performs exactly one request and reports what happened;
//! redirect and retry policy live in the provisioner.

use crate::error::DetectionError;
use crate::Result;
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Result of a single GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 200 OK; body streamed to the destination
    Written { bytes: u64 },
    /// 3xx with a Location header
    Redirect { status: u16, location: String },
    /// Anything else; nothing was written
    Rejected { status: u16 },
}

/// Performs a single GET and streams a 200 body to `dest`
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<FetchOutcome>;
}

/// reqwest-backed fetcher with automatic redirects disabled
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeouts(Duration::from_secs(30), Duration::from_secs(60))
    }

    /// `read` bounds each wait for more bytes, so a stalled body fails as a
    /// transient network error instead of hanging the download
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("circlenet-ext/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::none())
            .connect_timeout(connect)
            .read_timeout(read)
            .build()?;

        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        let network_failure = |e: reqwest::Error| DetectionError::NetworkFailure {
            url: url.to_string(),
            status: None,
            reason: e.to_string(),
        };

        let mut response = self.client.get(url).send().await.map_err(network_failure)?;
        let status = response.status();
        debug!(url, status = status.as_u16(), "GET");

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Ok(match location {
                Some(location) => FetchOutcome::Redirect {
                    status: status.as_u16(),
                    location,
                },
                None => FetchOutcome::Rejected {
                    status: status.as_u16(),
                },
            });
        }

        if status != StatusCode::OK {
            return Ok(FetchOutcome::Rejected {
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(network_failure)? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(FetchOutcome::Written { bytes })
    }
}
