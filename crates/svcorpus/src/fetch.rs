//! Imagery provider boundary and the HTTP street-view client.

use crate::geo::SamplePoint;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("svcorpus/", env!("CARGO_PKG_VERSION"));

/// Stands in for the API key wherever a config is formatted for logs.
pub const REDACTED: &str = "<redacted>";

/// One `(location, heading, pitch)` request. `fov` equals the heading step so
/// adjacent headings tile the full circle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRequest {
    pub point: SamplePoint,
    pub fov: u32,
    pub heading: u32,
    pub pitch: i32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("provider answered with status {0}")]
    Status(u16),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<reqwest::Error> for FetchError {
    // the request URL carries the API key in its query string
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(err.without_url())
    }
}

/// Source of panoramic tiles. Every error is non-fatal to the capture run: the
/// caller logs it and moves on to the next heading/pitch.
#[async_trait]
pub trait ImageryProvider: Send + Sync {
    async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError>;
}

#[derive(Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub api_key: String,
    pub width: u32,
    pub height: u32,
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://maps.googleapis.com/maps/api/streetview".into(),
            api_key: String::new(),
            width: 640,
            height: 640,
            timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for FetchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &REDACTED)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Street-view static image API client.
pub struct StreetViewProvider {
    client: Client,
    config: FetchConfig,
}

impl StreetViewProvider {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn query_params(&self, request: &TileRequest) -> Vec<(&'static str, String)> {
        vec![
            ("size", format!("{}x{}", self.config.width, self.config.height)),
            ("location", request.point.to_string()),
            ("fov", request.fov.to_string()),
            ("heading", request.heading.to_string()),
            ("pitch", request.pitch.to_string()),
            ("key", self.config.api_key.clone()),
        ]
    }
}

#[async_trait]
impl ImageryProvider for StreetViewProvider {
    async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&self.query_params(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?)
    }
}
