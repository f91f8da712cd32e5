use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ytdl-client")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend base URL (overrides BACKEND_URL)
    #[arg(short, long, global = true)]
    pub backend: Option<String>,

    /// SOCKS5/HTTP proxy (overrides BACKEND_PROXY)
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search videos
    Search {
        query: String,
    },

    /// List the downloadable formats of a video
    Formats {
        video_id: String,
    },

    /// Download a video through the backend worker
    Download {
        video_id: String,

        /// Index into the `formats` list (0 is the best audio track when present)
        #[arg(short, long, default_value = "0")]
        format: usize,

        /// Keep audio and video as separate files
        #[arg(long)]
        split_tracks: bool,

        /// Cut start in seconds, clamped to the video
        #[arg(long, allow_negative_numbers = true)]
        from: Option<i64>,

        /// Cut end in seconds, clamped to the video
        #[arg(long, allow_negative_numbers = true)]
        to: Option<i64>,

        /// Output directory (default: platform download directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
