// Test doubles for the gateway and the file retriever

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::errors::DownloadError;
use super::models::{
    DownloadProgress, DownloadStatus, JobCommand, JobRequest, ProgressEvent, Video, VideoDetails,
    VideoFormat, VideoInfo,
};
use super::traits::{BackendGateway, FileRetriever, ProgressHandler, Subscription};
use super::utils::lock;

/// In-memory gateway: records commands, lets tests push progress events
#[derive(Default)]
pub struct MockGateway {
    formats: Mutex<HashMap<String, Vec<VideoFormat>>>,
    handler: Arc<Mutex<Option<ProgressHandler>>>,
    start_error: Mutex<Option<DownloadError>>,
    pub info_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub started: Mutex<Vec<JobRequest>>,
    pub controls: Mutex<Vec<(String, JobCommand)>>,
    pub cleared: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_formats(&self, video_id: &str, formats: Vec<VideoFormat>) {
        lock(&self.formats).insert(video_id.to_string(), formats);
    }

    /// Make the next `start_job` fail with `error`
    pub fn fail_next_start(&self, error: DownloadError) {
        *lock(&self.start_error) = Some(error);
    }

    /// Deliver an event through the registered handler, like the push channel would
    pub fn emit(&self, event: ProgressEvent) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn has_handler(&self) -> bool {
        lock(&self.handler).is_some()
    }

    pub fn started(&self) -> Vec<JobRequest> {
        lock(&self.started).clone()
    }

    pub fn controls(&self) -> Vec<(String, JobCommand)> {
        lock(&self.controls).clone()
    }

    pub fn cleared(&self) -> Vec<String> {
        lock(&self.cleared).clone()
    }
}

#[async_trait]
impl BackendGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn search(&self, _query: &str) -> Result<Vec<Video>, DownloadError> {
        Ok(Vec::new())
    }

    async fn info(&self, video_id: &str) -> Result<VideoInfo, DownloadError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let formats = lock(&self.formats)
            .get(video_id)
            .cloned()
            .ok_or_else(|| DownloadError::MetadataFetch(format!("unknown video {}", video_id)))?;

        Ok(VideoInfo {
            video_details: VideoDetails {
                video_id: video_id.to_string(),
                title: format!("Video {}", video_id),
                length_seconds: 600,
                thumbnails: Vec::new(),
            },
            formats,
        })
    }

    async fn start_job(&self, request: JobRequest) -> Result<(), DownloadError> {
        lock(&self.started).push(request);
        match lock(&self.start_error).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn control_job(&self, video_id: &str, command: JobCommand) -> Result<(), DownloadError> {
        lock(&self.controls).push((video_id.to_string(), command));
        Ok(())
    }

    async fn clear_job(&self, filename: &str) -> Result<(), DownloadError> {
        lock(&self.cleared).push(filename.to_string());
        Ok(())
    }

    fn subscribe(&self, handler: ProgressHandler) -> Subscription {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handler) = Some(handler);
        let slot = self.handler.clone();
        Subscription::new(move || {
            *lock(&slot) = None;
        })
    }
}

/// Retriever that records requests instead of touching the network
#[derive(Default)]
pub struct RecordingRetriever {
    pub calls: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingRetriever {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FileRetriever for RecordingRetriever {
    async fn retrieve(&self, url: &str, filename: Option<&str>) -> Result<PathBuf, DownloadError> {
        lock(&self.calls).push((url.to_string(), filename.map(str::to_string)));
        Ok(PathBuf::from(filename.unwrap_or("download")))
    }
}

pub fn video_format(itag: u32, quality_label: &str, container: &str) -> VideoFormat {
    VideoFormat {
        itag,
        mime_type: Some(format!("video/{}", container)),
        container: Some(container.to_string()),
        quality_label: Some(quality_label.to_string()),
        has_video: true,
        has_audio: false,
        video_codec: Some("avc1.640028".to_string()),
        ..Default::default()
    }
}

pub fn audio_format(itag: u32, bitrate: u32, codec: &str) -> VideoFormat {
    VideoFormat {
        itag,
        mime_type: Some("audio/mp4".to_string()),
        container: Some("mp4".to_string()),
        has_video: false,
        has_audio: true,
        audio_bitrate: Some(bitrate),
        audio_codec: Some(codec.to_string()),
        ..Default::default()
    }
}

pub fn event(video_id: &str, status: DownloadStatus) -> ProgressEvent {
    ProgressEvent {
        video_id: video_id.to_string(),
        progress: DownloadProgress::with_status(status),
    }
}

pub fn downloading(video_id: &str, percent: f64) -> ProgressEvent {
    let mut e = event(video_id, DownloadStatus::Downloading);
    e.progress.percent = percent;
    e.progress.downloaded = (percent * 1000.0) as u64;
    e.progress.total = 100_000;
    e
}

pub fn finished(video_id: &str, url: &str, filename: &str) -> ProgressEvent {
    let mut e = event(video_id, DownloadStatus::Finished);
    e.progress.percent = 100.0;
    e.progress.download_url = Some(url.to_string());
    e.progress.download_filename = Some(filename.to_string());
    e
}
