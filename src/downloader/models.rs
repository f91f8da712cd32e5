// Common data models for the download client

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::DownloadError;
use super::utils::{f64_from_str_or_number, opt_u64_from_str_or_number, u64_from_str_or_number};

/// Video reference handed over by the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    /// Duration in milliseconds
    #[serde(default, deserialize_with = "u64_from_str_or_number")]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl Video {
    pub fn new(id: impl Into<String>, title: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: Some(id.into()),
            title: title.into(),
            duration: duration_ms,
            thumbnail_url: None,
        }
    }

    /// Id of the video, or `InvalidVideo` when it is missing or blank
    pub fn require_id(&self) -> Result<&str, DownloadError> {
        match self.id.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(DownloadError::InvalidVideo(format!(
                "video '{}' has no id",
                self.title
            ))),
        }
    }

    /// Whole seconds, rounded down
    pub fn duration_seconds(&self) -> u64 {
        self.duration / 1000
    }
}

/// Thumbnail entry of the info endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// `videoDetails` block of the info endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub video_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "u64_from_str_or_number")]
    pub length_seconds: u64,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

/// Full info response: details plus every available encoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub video_details: VideoDetails,
    #[serde(default)]
    pub formats: Vec<VideoFormat>,
}

impl VideoInfo {
    /// Build the video reference used for job operations
    pub fn to_video(&self) -> Video {
        let details = &self.video_details;
        let thumbnail_url = details
            .thumbnails
            .iter()
            .max_by_key(|t| t.width.unwrap_or(0))
            .map(|t| t.url.clone());

        Video {
            id: Some(details.video_id.clone()),
            title: details.title.clone(),
            duration: details.length_seconds * 1000,
            thumbnail_url,
        }
    }
}

/// Audio codecs in ascending preference
const AUDIO_ENCODING_RANKS: [&str; 6] = ["mp4a", "mp3", "vorbis", "aac", "opus", "flac"];

/// One raw encoding as reported by the info endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    #[serde(default)]
    pub itag: u32,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Container (mp4, webm)
    #[serde(default)]
    pub container: Option<String>,
    /// Quality label (e.g., "1080p60"); absent for audio-only encodings
    #[serde(default)]
    pub quality_label: Option<String>,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub has_audio: bool,
    /// Audio bitrate in kbps
    #[serde(default)]
    pub audio_bitrate: Option<u32>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default, deserialize_with = "opt_u64_from_str_or_number")]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

impl VideoFormat {
    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.container.as_deref() == Some(container)
    }

    /// Codec preference, 0 when the codec is unknown
    pub fn audio_encoding_rank(&self) -> u8 {
        let codec = match self.audio_codec.as_deref() {
            Some(c) => c,
            None => return 0,
        };
        AUDIO_ENCODING_RANKS
            .iter()
            .rposition(|name| codec.contains(name))
            .map_or(0, |pos| pos as u8 + 1)
    }

    /// Ordering key for "highest audio": bitrate first, then codec
    pub fn audio_rank(&self) -> (u32, u8) {
        (self.audio_bitrate.unwrap_or(0), self.audio_encoding_rank())
    }
}

/// Curated encoding option with the extension the worker should produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatCandidate {
    #[serde(flatten)]
    pub format: VideoFormat,
    pub extension: String,
}

impl FormatCandidate {
    pub fn new(format: VideoFormat, extension: impl Into<String>) -> Self {
        Self {
            format,
            extension: extension.into(),
        }
    }

    /// Human-readable label for selection lists
    pub fn label(&self) -> String {
        match &self.format.quality_label {
            Some(q) => format!("{} ({})", q, self.extension),
            None => match self.format.audio_bitrate {
                Some(kbps) => format!("Audio {} kbps ({})", kbps, self.extension),
                None => format!("Audio ({})", self.extension),
            },
        }
    }
}

/// Trim window in whole seconds, always within `[0, duration]` with `from <= to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutRange {
    pub from: u64,
    pub to: u64,
}

impl CutRange {
    /// Clamp user input with an absolute end offset
    pub fn clamped(from: i64, to: i64, duration_secs: u64) -> Self {
        let max = i64::try_from(duration_secs).unwrap_or(i64::MAX);
        let from = from.clamp(0, max);
        let to = to.clamp(from, max);
        Self {
            from: from as u64,
            to: to as u64,
        }
    }

    /// Clamp user input expressed as start plus length
    pub fn with_length(from: i64, length: i64, duration_secs: u64) -> Self {
        Self::clamped(from, from.saturating_add(length.max(0)), duration_secs)
    }

    /// Re-apply the clamp law against a (possibly different) duration
    pub fn clamp_to(self, duration_secs: u64) -> Self {
        let from = self.from.min(duration_secs);
        Self {
            from,
            to: self.to.clamp(from, duration_secs),
        }
    }

    pub fn length(&self) -> u64 {
        self.to - self.from
    }
}

/// Job status as reported by the remote worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Queue,
    Downloading,
    Processing,
    Paused,
    Stopped,
    Finished,
    Failed,
}

impl DownloadStatus {
    /// No further transition without a fresh start
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    /// States from which the worker accepts pause/stop
    pub fn is_controllable(&self) -> bool {
        matches!(self, Self::Downloading | Self::Queue)
    }
}

/// Complete progress snapshot; every event replaces the previous one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "f64_from_str_or_number")]
    pub percent: f64,
    /// Bytes downloaded so far
    #[serde(default, deserialize_with = "u64_from_str_or_number")]
    pub downloaded: u64,
    /// Total bytes, 0 while unknown
    #[serde(default, deserialize_with = "u64_from_str_or_number")]
    pub total: u64,
    /// Elapsed seconds
    #[serde(default, deserialize_with = "f64_from_str_or_number")]
    pub time: f64,
    /// Estimated seconds remaining
    #[serde(default, deserialize_with = "f64_from_str_or_number")]
    pub time_left: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_filename: Option<String>,
}

impl DownloadProgress {
    pub fn with_status(status: DownloadStatus) -> Self {
        Self {
            status,
            error: None,
            percent: 0.0,
            downloaded: 0,
            total: 0,
            time: 0.0,
            time_left: 0.0,
            download_url: None,
            download_filename: None,
        }
    }

    pub fn starting() -> Self {
        Self::with_status(DownloadStatus::Starting)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::with_status(DownloadStatus::Failed)
        }
    }
}

/// `progress` event of the push channel, tagged with its video id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub video_id: String,
    #[serde(flatten)]
    pub progress: DownloadProgress,
}

/// `queueDownload` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub video: Video,
    pub format: FormatCandidate,
    pub split_tracks: bool,
    pub audio_only: bool,
    pub cut: Option<CutRange>,
}

impl JobRequest {
    pub fn new(
        video: Video,
        format: FormatCandidate,
        split_tracks: bool,
        cut: Option<CutRange>,
    ) -> Self {
        let audio_only = !format.format.has_video;
        Self {
            video,
            format,
            split_tracks,
            audio_only,
            cut,
        }
    }

    pub fn video_id(&self) -> Option<&str> {
        self.video.id.as_deref()
    }
}

/// Remote control commands for a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    Pause,
    Resume,
    Stop,
}

impl JobCommand {
    /// Push channel event carrying this command
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Pause => "pauseDownload",
            Self::Resume => "resumeDownload",
            Self::Stop => "stopDownload",
        }
    }
}

/// A tracked job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub video: Video,
    pub format: FormatCandidate,
    pub split_tracks: bool,
    pub cut: Option<CutRange>,
    pub progress: DownloadProgress,
}

/// Options of a tracked job, for re-opening a dialog on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub format: FormatCandidate,
    pub split_tracks: bool,
}

/// Committed, observable state; `revision` grows by one per visible change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadsSnapshot {
    pub revision: u64,
    pub downloads: HashMap<String, Download>,
}

/// Network configuration for the backend gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the backend (e.g., "http://localhost:8080")
    pub base_url: String,

    /// SOCKS5/HTTP proxy URL (e.g., "socks5://127.0.0.1:1080")
    pub proxy: Option<String>,

    /// Timeout in seconds
    pub timeout: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            proxy: None,
            timeout: Some(30),
        }
    }
}

impl GatewayConfig {
    /// Read `BACKEND_URL`, `BACKEND_PROXY` and `BACKEND_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, DownloadError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("BACKEND_URL") {
            config.base_url = url;
        }
        config.proxy = std::env::var("BACKEND_PROXY")
            .ok()
            .filter(|p| !p.trim().is_empty());
        if let Ok(raw) = std::env::var("BACKEND_TIMEOUT_SECS") {
            let secs = raw.trim().parse::<u32>().map_err(|_| {
                DownloadError::Config(format!("BACKEND_TIMEOUT_SECS is not a number: {}", raw))
            })?;
            config.timeout = (secs > 0).then_some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_timeout(mut self, seconds: Option<u32>) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(DownloadError::Config(format!(
                "backend URL must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        Ok(())
    }
}

pub const THROTTLE_WINDOW: Duration = Duration::from_millis(300);
pub const GRACE_PERIOD: Duration = Duration::from_secs(4);
pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Timing policy of the job orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum spacing of progress commits per job
    pub throttle_window: Duration,
    /// How long a terminal job stays visible
    pub grace_period: Duration,
    /// Fail a job after this long without events; `None` disables the watchdog
    pub stall_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            throttle_window: THROTTLE_WINDOW,
            grace_period: GRACE_PERIOD,
            stall_timeout: Some(STALL_TIMEOUT),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_throttle_window(mut self, window: Duration) -> Self {
        self.throttle_window = window;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }
}
