use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::{StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::UpdateError;
use crate::feed::{ProgressFn, ReleaseFeed};
use crate::manifest::{UpdateFile, UpdateInfo, parse_manifest};
use crate::version::Channel;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_DELAYS_SECS: [u64; 3] = [0, 2, 5];

#[derive(Debug, Clone)]
pub struct ManifestClientConfig {
    /// Base URL of the update feed, without the channel segment.
    pub feed_url: String,
    /// Platform manifest name, e.g. `latest-linux.yml`.
    pub manifest_file: String,
    /// Bound on a whole manifest request.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest wait for the next chunk of an artifact download.
    pub idle_timeout: Duration,
    /// Delay before each manifest attempt; the first entry is normally zero.
    pub retry_delays: Vec<Duration>,
}

impl ManifestClientConfig {
    #[must_use]
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            manifest_file: glint_platform::manifest_file_name().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retry_delays: DEFAULT_RETRY_DELAYS_SECS
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

/// HTTP client for a channel-scoped update feed.
#[derive(Debug, Clone)]
pub struct ManifestClient {
    client: reqwest::Client,
    feed_base: String,
    manifest_file: String,
    request_timeout: Duration,
    idle_timeout: Duration,
    retry_delays: Vec<Duration>,
}

impl ManifestClient {
    /// # Errors
    /// Returns an error when the feed URL is not an absolute http(s) URL or
    /// the HTTP client cannot be built.
    pub fn new(config: ManifestClientConfig) -> Result<Self, UpdateError> {
        let feed_base = config.feed_url.trim().trim_end_matches('/').to_string();
        let parsed = Url::parse(&feed_base).map_err(|error| UpdateError::InvalidFeedUrl {
            url: config.feed_url.clone(),
            reason: error.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(UpdateError::InvalidFeedUrl {
                url: config.feed_url,
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(format!("glint/{}/updater", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| UpdateError::http("failed to build update client", error))?;

        Ok(Self {
            client,
            feed_base,
            manifest_file: config.manifest_file,
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
            retry_delays: config.retry_delays,
        })
    }

    /// `<feed>/<channel>/<manifest>`
    ///
    /// # Errors
    /// Returns an error if the joined URL does not parse.
    pub fn manifest_url(&self, channel: Channel) -> Result<Url, UpdateError> {
        self.parse_url(&format!(
            "{}/{}/{}",
            self.feed_base, channel, self.manifest_file
        ))
    }

    /// `<feed>/<manifest>`, the layout used before feeds were split by channel.
    ///
    /// # Errors
    /// Returns an error if the joined URL does not parse.
    pub fn legacy_manifest_url(&self) -> Result<Url, UpdateError> {
        self.parse_url(&format!("{}/{}", self.feed_base, self.manifest_file))
    }

    fn parse_url(&self, raw: &str) -> Result<Url, UpdateError> {
        Url::parse(raw).map_err(|error| UpdateError::InvalidFeedUrl {
            url: raw.to_string(),
            reason: error.to_string(),
        })
    }

    async fn fetch_with_fallback(&self, channel: Channel) -> Result<UpdateInfo, UpdateError> {
        let url = self.manifest_url(channel)?;
        match self.fetch_once(&url).await {
            Err(UpdateError::Server { status, .. })
                if status == StatusCode::NOT_FOUND && channel == Channel::Stable =>
            {
                let legacy = self.legacy_manifest_url()?;
                debug!("No channel manifest at {url}, trying {legacy}");
                self.fetch_once(&legacy).await
            }
            other => other,
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<UpdateInfo, UpdateError> {
        let seconds = self.request_timeout.as_secs();
        let request = async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|error| UpdateError::http("manifest request failed", error))?;

            if !response.status().is_success() {
                return Err(UpdateError::Server {
                    url: url.to_string(),
                    status: response.status(),
                });
            }

            response
                .text()
                .await
                .map_err(|error| UpdateError::http("failed to read manifest", error))
        };

        let body = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| UpdateError::Timeout {
                operation: "manifest fetch",
                seconds,
            })??;

        parse_manifest(&body, url)
    }

    async fn open_stream(
        &self,
        file: &UpdateFile,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, UpdateError> {
        let url = Url::parse(&file.url).map_err(|error| UpdateError::InvalidFeedUrl {
            url: file.url.clone(),
            reason: error.to_string(),
        })?;

        let request = tokio::time::timeout(self.request_timeout, self.client.get(url).send());
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(UpdateError::Cancelled),
            sent = request => sent,
        };
        let response = sent
            .map_err(|_| UpdateError::Timeout {
                operation: "download request",
                seconds: self.request_timeout.as_secs(),
            })?
            .map_err(|error| UpdateError::http("download request failed", error))?;

        if !response.status().is_success() {
            return Err(UpdateError::Server {
                url: file.url.clone(),
                status: response.status(),
            });
        }
        Ok(response)
    }

    async fn stream_to_file(
        &self,
        file: &UpdateFile,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        let response = self.open_stream(file, cancel).await?;
        let total = response.content_length().or(file.size);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                UpdateError::io_with_path("failed to create download directory", parent, error)
            })?;
        }
        let mut out = tokio::fs::File::create(dest).await.map_err(|error| {
            UpdateError::io_with_path("failed to create download file", dest, error)
        })?;

        let mut transferred: u64 = 0;
        progress(transferred, total);

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(UpdateError::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(UpdateError::Timeout {
                        operation: "artifact download",
                        seconds: self.idle_timeout.as_secs(),
                    });
                }
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    chunk.map_err(|error| UpdateError::http("download stream error", error))?
                }
            };

            out.write_all(&chunk).await.map_err(|error| {
                UpdateError::io_with_path("failed to write download data", dest, error)
            })?;
            transferred += chunk.len() as u64;
            progress(transferred, total);
        }

        out.flush().await.map_err(|error| {
            UpdateError::io_with_path("failed to flush download file", dest, error)
        })?;

        Ok(transferred)
    }
}

#[async_trait]
impl ReleaseFeed for ManifestClient {
    async fn fetch_manifest(&self, channel: Channel) -> Result<UpdateInfo, UpdateError> {
        let single_attempt = [Duration::ZERO];
        let delays = if self.retry_delays.is_empty() {
            &single_attempt[..]
        } else {
            &self.retry_delays[..]
        };

        let mut last_error = None;
        for (attempt, delay) in delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }

            match self.fetch_with_fallback(channel).await {
                Ok(info) => {
                    info!("Fetched {channel} manifest: version {}", info.version);
                    return Ok(info);
                }
                Err(error) if error.is_retryable() => {
                    debug!("Manifest attempt {} failed: {error}", attempt + 1);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or(UpdateError::Timeout {
            operation: "manifest fetch",
            seconds: self.request_timeout.as_secs(),
        }))
    }

    async fn download_artifact(
        &self,
        file: &UpdateFile,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        info!("Downloading update from {}", file.url);
        let result = self.stream_to_file(file, dest, progress, cancel).await;

        match &result {
            Ok(bytes) => info!("Download complete: {bytes} bytes"),
            Err(error) => {
                warn!("Download failed, removing partial file: {error}");
                let _ = tokio::fs::remove_file(dest).await;
            }
        }
        result
    }
}
