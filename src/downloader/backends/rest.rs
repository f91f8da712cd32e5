use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::downloader::errors::DownloadError;
use crate::downloader::models::{GatewayConfig, Video, VideoInfo};
use crate::downloader::utils;

/// Request/response half of the gateway: `GET /search` and `GET /info`
pub struct RestClient {
    client: reqwest::Client,
    base: Url,
}

impl RestClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, DownloadError> {
        Ok(Self {
            client: utils::build_http_client(config)?,
            base: utils::base_url(config)?,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Video>, DownloadError> {
        let mut url = utils::endpoint(&self.base, "search")?;
        url.query_pairs_mut().append_pair("q", query);
        self.get_json(url).await
    }

    pub async fn info(&self, video_id: &str) -> Result<VideoInfo, DownloadError> {
        let mut url = utils::endpoint(&self.base, "info")?;
        url.query_pairs_mut().append_pair("v", video_id);
        self.get_json(url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, DownloadError> {
        debug!(url = %url, "GET");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "backend returned an error status");
            return Err(DownloadError::MetadataFetch(format!(
                "{} returned HTTP {}",
                url.path(),
                status
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            DownloadError::MetadataFetch(format!("invalid JSON from {}: {}", url.path(), e))
        })
    }
}
