// Helper functions shared by the gateway, retriever and models

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::downloader::errors::DownloadError;
use crate::downloader::models::GatewayConfig;

/// Default socket.io mount point on the backend
pub const PUSH_CHANNEL_PATH: &str = "socket.io/";

/// Engine.IO protocol revision spoken by the push channel
pub const ENGINE_IO_VERSION: &str = "4";

/// Lock a mutex, recovering the data if a holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StrOrNumber {
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl StrOrNumber {
    fn into_f64(self) -> Option<f64> {
        let value = match self {
            Self::Unsigned(n) => n as f64,
            Self::Float(f) => f,
            Self::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    fn into_u64(self) -> Option<u64> {
        match self {
            Self::Unsigned(n) => Some(n),
            Self::Float(f) if f.is_finite() && f >= 0.0 => Some(f as u64),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64),
        }
    }
}

/// The info endpoint sends numbers as strings ("215"); accept both
pub fn u64_from_str_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_u64_from_str_or_number(deserializer)?.unwrap_or(0))
}

pub fn opt_u64_from_str_or_number<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<StrOrNumber>::deserialize(deserializer)?;
    Ok(raw.and_then(StrOrNumber::into_u64))
}

/// Progress numbers from the worker: `null` (a serialized NaN/Infinity),
/// strings and fractions all fold into a finite value, 0 when unusable
pub fn f64_from_str_or_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<StrOrNumber>::deserialize(deserializer)?;
    Ok(raw.and_then(StrOrNumber::into_f64).unwrap_or(0.0))
}

fn client_builder(config: &GatewayConfig) -> Result<reqwest::ClientBuilder, DownloadError> {
    let mut builder = reqwest::Client::builder();

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| DownloadError::Config(format!("invalid proxy {}: {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder)
}

/// Build the HTTP client with optional proxy and timeout
pub fn build_http_client(config: &GatewayConfig) -> Result<reqwest::Client, DownloadError> {
    let mut builder = client_builder(config)?;

    if let Some(secs) = config.timeout {
        builder = builder.timeout(Duration::from_secs(u64::from(secs)));
    }

    builder
        .build()
        .map_err(|e| DownloadError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Client for artifact downloads: the timeout only bounds connecting,
/// a large file may stream for longer
pub fn build_http_client_for_files(
    config: &GatewayConfig,
) -> Result<reqwest::Client, DownloadError> {
    let mut builder = client_builder(config)?;

    if let Some(secs) = config.timeout {
        builder = builder.connect_timeout(Duration::from_secs(u64::from(secs)));
    }

    builder
        .build()
        .map_err(|e| DownloadError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Parse the backend base URL
pub fn base_url(config: &GatewayConfig) -> Result<Url, DownloadError> {
    config.validate()?;
    Ok(Url::parse(&config.base_url)?)
}

/// Join `path` below the base URL, keeping any path prefix the base has
pub fn endpoint(base: &Url, path: &str) -> Result<Url, DownloadError> {
    let mut root = base.clone();
    if !root.path().ends_with('/') {
        let with_slash = format!("{}/", root.path());
        root.set_path(&with_slash);
    }
    Ok(root.join(path.trim_start_matches('/'))?)
}

/// Switch the base URL to ws/wss and point it at the socket.io
/// websocket transport
pub fn push_channel_url(base: &Url) -> Result<Url, DownloadError> {
    let mut url = endpoint(base, PUSH_CHANNEL_PATH)?;
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket");
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(DownloadError::Config(format!(
                "unsupported backend scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| DownloadError::Config(format!("cannot use scheme {} for {}", scheme, base)))?;
    Ok(url)
}

/// Resolve a `downloadUrl` that may be relative to the backend
pub fn resolve_download_url(base: &Url, raw: &str) -> Result<Url, DownloadError> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(base.join(raw)?),
        Err(e) => Err(DownloadError::Retrieval(format!("bad download URL {}: {}", raw, e))),
    }
}

/// Make a server-provided filename safe to create in the download dir
pub fn sanitize_filename(name: &str) -> String {
    lazy_static::lazy_static! {
        static ref UNSAFE_RE: Regex = Regex::new(r#"[/\\:*?"<>|\x00-\x1f]+"#).unwrap();
        static ref DOTS_RE: Regex = Regex::new(r"^\.+").unwrap();
    }

    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = UNSAFE_RE.replace_all(base, "_");
    let cleaned = DOTS_RE.replace(cleaned.trim(), "");
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Last path segment of a URL, used when the worker sent no filename
pub fn filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Platform download directory, falling back to the working directory
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}
