// Backend gateway and file retrieval trait definitions

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::DownloadError;
use super::models::{JobCommand, JobRequest, ProgressEvent, Video, VideoFormat, VideoInfo};

/// Callback invoked once per progress event, in arrival order
pub type ProgressHandler = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Handle of an active progress handler; dropping it revokes the handler
pub struct Subscription {
    revoke: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(revoke: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            revoke: Some(Box::new(revoke)),
        }
    }

    pub fn revoke(mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.revoke.is_some())
            .finish()
    }
}

/// Request/response metadata lookups plus the job push channel
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Name of the gateway (for logging)
    fn name(&self) -> &'static str;

    /// Search videos by free text
    async fn search(&self, query: &str) -> Result<Vec<Video>, DownloadError>;

    /// Video details with the raw encoding list
    async fn info(&self, video_id: &str) -> Result<VideoInfo, DownloadError>;

    /// Raw encodings of a video; never a partial list
    async fn lookup_metadata(&self, video_id: &str) -> Result<Vec<VideoFormat>, DownloadError> {
        self.info(video_id).await.map(|info| info.formats)
    }

    /// Queue a job on the remote worker; progress arrives via `subscribe`
    async fn start_job(&self, request: JobRequest) -> Result<(), DownloadError>;

    /// Pause, resume or stop a job
    async fn control_job(&self, video_id: &str, command: JobCommand) -> Result<(), DownloadError>;

    /// Let the worker release a finished artifact
    async fn clear_job(&self, filename: &str) -> Result<(), DownloadError>;

    /// Install the progress handler, replacing any previous one
    fn subscribe(&self, handler: ProgressHandler) -> Subscription;
}

/// Local side effect run when a job finishes with a download URL
#[async_trait]
pub trait FileRetriever: Send + Sync {
    /// Fetch `url` and store it; returns the local path
    async fn retrieve(&self, url: &str, filename: Option<&str>) -> Result<PathBuf, DownloadError>;
}
