use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::downloader::errors::DownloadError;
use crate::downloader::models::GatewayConfig;
use crate::downloader::traits::FileRetriever;
use crate::downloader::utils;

/// Streams finished artifacts from the backend into a local directory
pub struct HttpFileRetriever {
    client: reqwest::Client,
    base: Url,
    output_dir: PathBuf,
}

impl HttpFileRetriever {
    pub fn new(config: &GatewayConfig, output_dir: PathBuf) -> Result<Self, DownloadError> {
        Ok(Self {
            client: utils::build_http_client_for_files(config)?,
            base: utils::base_url(config)?,
            output_dir,
        })
    }

    /// Save into the platform download directory
    pub fn with_default_dir(config: &GatewayConfig) -> Result<Self, DownloadError> {
        Self::new(config, utils::default_download_dir())
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn target_path(&self, url: &Url, filename: Option<&str>) -> PathBuf {
        let name = filename
            .map(str::to_string)
            .or_else(|| utils::filename_from_url(url))
            .unwrap_or_default();
        self.output_dir.join(utils::sanitize_filename(&name))
    }
}

#[async_trait]
impl FileRetriever for HttpFileRetriever {
    async fn retrieve(&self, url: &str, filename: Option<&str>) -> Result<PathBuf, DownloadError> {
        let url = utils::resolve_download_url(&self.base, url)?;
        let target = self.target_path(&url, filename);
        let partial = target.with_extension(match target.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });

        info!(url = %url, path = %target.display(), "Retrieving artifact");

        tokio::fs::create_dir_all(&self.output_dir).await?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::Retrieval(format!("request to {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Retrieval(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    if let Err(rm) = tokio::fs::remove_file(&partial).await {
                        warn!(path = %partial.display(), error = %rm, "failed to remove partial file");
                    }
                    return Err(DownloadError::Retrieval(format!(
                        "stream from {} broke: {}",
                        url, e
                    )));
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;

        debug!(path = %target.display(), bytes = written, "artifact stored");
        Ok(target)
    }
}
