// Downloader module - job tracking against the remote download worker

pub mod backends;
pub mod errors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod throttle;
pub mod traits;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::{HttpFileRetriever, RemoteGateway};
pub use errors::DownloadError;
pub use format_selector::{FormatCache, FormatSelector};
pub use models::{
    CutRange, Download, DownloadOptions, DownloadProgress, DownloadStatus, DownloadsSnapshot,
    FormatCandidate, GatewayConfig, JobCommand, JobRequest, OrchestratorConfig, ProgressEvent,
    Video, VideoFormat, VideoInfo,
};
pub use orchestrator::{JobOrchestrator, StatusWatch};
pub use traits::{BackendGateway, FileRetriever, ProgressHandler, Subscription};
