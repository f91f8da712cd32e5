// Backend implementations: REST metadata, push channel, artifact retrieval

pub mod file;
pub mod packet;
pub mod rest;
pub mod socket;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::downloader::errors::DownloadError;
use crate::downloader::models::{GatewayConfig, JobCommand, JobRequest, Video, VideoInfo};
use crate::downloader::traits::{BackendGateway, ProgressHandler, Subscription};
use crate::downloader::utils;

pub use file::HttpFileRetriever;
pub use rest::RestClient;
pub use socket::PushChannel;

/// Outbound event that queues a job
pub const QUEUE_EVENT: &str = "queueDownload";

/// Outbound event that lets the worker drop a retrieved artifact
pub const CLEAR_EVENT: &str = "clearDownload";

/// Gateway to the download backend over HTTP plus a socket.io push channel
pub struct RemoteGateway {
    rest: RestClient,
    push: PushChannel,
}

impl RemoteGateway {
    /// Validate the config and open the push channel
    pub async fn connect(config: &GatewayConfig) -> Result<Self, DownloadError> {
        let rest = RestClient::new(config)?;
        let push_url = utils::push_channel_url(rest.base())?;
        let push = PushChannel::connect(push_url).await?;

        info!(base = %rest.base(), sid = push.sid(), "Connected to backend");
        Ok(Self { rest, push })
    }

    fn emit_logged<T: serde::Serialize>(&self, event: &str, data: &T) -> Result<(), DownloadError> {
        self.push.emit(event, data).map_err(|e| {
            warn!(event, url = %self.push.url(), error = %e, "failed to send command");
            e
        })
    }
}

#[async_trait]
impl BackendGateway for RemoteGateway {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn search(&self, query: &str) -> Result<Vec<Video>, DownloadError> {
        let videos = self.rest.search(query).await?;
        debug!(query, results = videos.len(), "search finished");
        Ok(videos)
    }

    async fn info(&self, video_id: &str) -> Result<VideoInfo, DownloadError> {
        let info = self.rest.info(video_id).await?;
        debug!(video_id, formats = info.formats.len(), "info fetched");
        Ok(info)
    }

    async fn start_job(&self, request: JobRequest) -> Result<(), DownloadError> {
        info!(
            video_id = request.video_id().unwrap_or_default(),
            itag = request.format.format.itag,
            audio_only = request.audio_only,
            split_tracks = request.split_tracks,
            "Queueing download"
        );
        self.emit_logged(QUEUE_EVENT, &request)
    }

    async fn control_job(&self, video_id: &str, command: JobCommand) -> Result<(), DownloadError> {
        debug!(video_id, ?command, "sending job command");
        self.emit_logged(command.event_name(), &video_id)
    }

    async fn clear_job(&self, filename: &str) -> Result<(), DownloadError> {
        debug!(filename, "releasing artifact");
        self.emit_logged(CLEAR_EVENT, &filename)
    }

    fn subscribe(&self, handler: ProgressHandler) -> Subscription {
        self.push.subscribe(handler)
    }
}
