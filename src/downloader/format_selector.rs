// FormatSelector - turns the raw encoding list into UI-ready candidates
//
// Handles:
// - Best audio-only track detection (offered as MP3)
// - Video-only MP4 encodings, one per quality label
// - Per-video memoization of the result for the process lifetime

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::errors::DownloadError;
use super::models::{FormatCandidate, VideoFormat};
use super::traits::BackendGateway;
use super::utils::lock;

/// Container of the video-only encodings offered for download
pub const VIDEO_CONTAINER: &str = "mp4";

/// Extension the worker converts the audio track to
pub const AUDIO_EXTENSION: &str = "mp3";

/// Format selector with best-audio detection and quality dedup
pub struct FormatSelector;

impl FormatSelector {
    /// Build the candidate list: best audio first (if any), then one MP4 per quality label
    pub fn select_candidates(formats: &[VideoFormat]) -> Vec<FormatCandidate> {
        let mut seen_labels: Vec<&str> = Vec::new();
        let mut candidates: Vec<FormatCandidate> = Vec::new();

        if let Some(audio) = Self::find_best_audio(formats) {
            candidates.push(FormatCandidate::new(audio.clone(), AUDIO_EXTENSION));
        }

        for format in formats
            .iter()
            .filter(|f| f.is_video_only() && f.has_container(VIDEO_CONTAINER))
        {
            let label = format.quality_label.as_deref().unwrap_or("");
            if seen_labels.contains(&label) {
                continue;
            }
            seen_labels.push(label);

            candidates.push(FormatCandidate::new(format.clone(), VIDEO_CONTAINER));
        }

        candidates
    }

    /// Highest-ranked audio-only format; ties keep the earliest entry
    pub fn find_best_audio(formats: &[VideoFormat]) -> Option<&VideoFormat> {
        formats
            .iter()
            .filter(|f| f.is_audio_only())
            .fold(None, |best: Option<&VideoFormat>, f| match best {
                Some(b) if b.audio_rank() >= f.audio_rank() => Some(b),
                _ => Some(f),
            })
    }
}

/// Append-only cache of candidate lists keyed by video id
#[derive(Default)]
pub struct FormatCache {
    entries: Mutex<HashMap<String, Arc<Vec<FormatCandidate>>>>,
}

impl FormatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, video_id: &str) -> Option<Arc<Vec<FormatCandidate>>> {
        lock(&self.entries).get(video_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidates for a video, fetching raw metadata on the first call only.
    /// Failures are returned as `MetadataFetch` and never cached.
    pub async fn fetch(
        &self,
        video_id: &str,
        gateway: &dyn BackendGateway,
    ) -> Result<Arc<Vec<FormatCandidate>>, DownloadError> {
        if let Some(cached) = self.get(video_id) {
            debug!(video_id, "format cache hit");
            return Ok(cached);
        }

        let raw = gateway.lookup_metadata(video_id).await.map_err(|e| {
            warn!(video_id, gateway = gateway.name(), error = %e, "format lookup failed");
            match e {
                DownloadError::MetadataFetch(_) => e,
                other => DownloadError::MetadataFetch(other.to_string()),
            }
        })?;

        let candidates = Arc::new(FormatSelector::select_candidates(&raw));
        debug!(
            video_id,
            raw = raw.len(),
            candidates = candidates.len(),
            "format candidates selected"
        );

        // A concurrent fetch may have landed first; keep whichever is stored
        let mut entries = lock(&self.entries);
        let stored = entries
            .entry(video_id.to_string())
            .or_insert(candidates)
            .clone();
        Ok(stored)
    }
}
