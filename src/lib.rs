pub mod downloader;

pub use downloader::{
    BackendGateway, CutRange, DownloadError, DownloadStatus, FileRetriever, FormatCache,
    FormatCandidate, GatewayConfig, HttpFileRetriever, JobOrchestrator, OrchestratorConfig,
    RemoteGateway, Video,
};
