mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Args, Command};
use youtube_downloader_client::downloader::models::{DownloadProgress, OrchestratorConfig};
use youtube_downloader_client::downloader::{FormatCandidate, FormatSelector, VideoInfo};
use youtube_downloader_client::downloader::utils;
use youtube_downloader_client::{
    BackendGateway, CutRange, FormatCache, GatewayConfig, HttpFileRetriever, JobOrchestrator,
    RemoteGateway,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = GatewayConfig::from_env().context("Invalid backend configuration")?;
    if let Some(url) = args.backend {
        config = config.with_base_url(url);
    }
    if args.proxy.is_some() {
        config = config.with_proxy(args.proxy);
    }
    config.validate()?;

    let gateway = Arc::new(
        RemoteGateway::connect(&config)
            .await
            .with_context(|| format!("Failed to connect to {}", config.base_url))?,
    );

    match args.command {
        Command::Search { query } => search(gateway.as_ref(), &query).await,
        Command::Formats { video_id } => formats(gateway.as_ref(), &video_id).await,
        Command::Download {
            video_id,
            format,
            split_tracks,
            from,
            to,
            output,
        } => {
            let output = output.unwrap_or_else(utils::default_download_dir);
            download(gateway, &config, &video_id, format, split_tracks, (from, to), output).await
        }
    }
}

async fn search(gateway: &dyn BackendGateway, query: &str) -> Result<()> {
    let videos = gateway.search(query).await?;
    if videos.is_empty() {
        println!("No results");
    }
    for video in videos {
        println!(
            "{:<14} {:>6}s  {}",
            video.id.as_deref().unwrap_or("-"),
            video.duration_seconds(),
            video.title
        );
    }
    Ok(())
}

async fn formats(gateway: &dyn BackendGateway, video_id: &str) -> Result<()> {
    let candidates = FormatCache::new().fetch(video_id, gateway).await?;
    if candidates.is_empty() {
        println!("No downloadable formats");
    }
    for (i, candidate) in candidates.iter().enumerate() {
        println!("[{}] {}", i, candidate.label());
    }
    Ok(())
}

async fn download(
    gateway: Arc<RemoteGateway>,
    config: &GatewayConfig,
    video_id: &str,
    format_index: usize,
    split_tracks: bool,
    (from, to): (Option<i64>, Option<i64>),
    output: PathBuf,
) -> Result<()> {
    let info = gateway.info(video_id).await?;
    let video = info.to_video();
    let format = pick_format(&info, format_index)?;

    let duration = video.duration_seconds();
    let cut = match (from, to) {
        (None, None) => None,
        (from, to) => Some(CutRange::clamped(
            from.unwrap_or(0),
            to.unwrap_or(duration as i64),
            duration,
        )),
    };

    let retriever = Arc::new(HttpFileRetriever::new(config, output)?);
    info!(output = %retriever.output_dir().display(), "Saving artifacts");

    let orchestrator = JobOrchestrator::new(gateway, retriever, OrchestratorConfig::default());
    let mut updates = orchestrator.subscribe();

    println!("Downloading {} as {}", video.title, format.label());
    orchestrator.start(&video, format, split_tracks, cut).await?;

    let mut stopping = false;
    let mut last: Option<DownloadProgress> = None;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let progress = updates
                    .borrow_and_update()
                    .downloads
                    .get(video_id)
                    .map(|d| d.progress.clone());
                match progress {
                    Some(progress) => {
                        if last.as_ref() != Some(&progress) {
                            print_progress(&progress);
                            last = Some(progress);
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                warn!(video_id, "Interrupted, stopping download");
                stopping = true;
                orchestrator.stop(&video).await?;
            }
        }
    }

    orchestrator.finish_retrievals().await;

    match last.map(|p| p.status) {
        Some(status) => println!("Done: {:?}", status),
        None => println!("Done"),
    }
    Ok(())
}

/// Candidate `index` of an already fetched info response
fn pick_format(info: &VideoInfo, index: usize) -> Result<FormatCandidate> {
    let candidates = FormatSelector::select_candidates(&info.formats);
    let count = candidates.len();
    candidates.into_iter().nth(index).ok_or_else(|| {
        anyhow!(
            "format {} out of range, {} has {} formats",
            index,
            info.video_details.video_id,
            count
        )
    })
}

fn print_progress(progress: &DownloadProgress) {
    match &progress.error {
        Some(error) => println!("{:?}: {}", progress.status, error),
        None if progress.total > 0 => println!(
            "{:?} {:5.1}%  {}/{} bytes  ~{:.0}s left",
            progress.status, progress.percent, progress.downloaded, progress.total, progress.time_left
        ),
        None => println!("{:?} {:5.1}%", progress.status, progress.percent),
    }
}
