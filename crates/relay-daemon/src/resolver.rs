//! yt-dlp backed resolver: locator -> playable source URL + title.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use relay_proto::state::FALLBACK_TITLE;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("failed to run resolver: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("resolver failed for '{locator}': {message}")]
    Failed { locator: String, message: String },
    #[error("unreadable resolver output for '{locator}': {source}")]
    Parse {
        locator: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no playable audio URL for '{0}'")]
    NoUrl(String),
}

/// A locator resolved for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub url: String,
    pub title: String,
}

/// What a top-level enqueue input turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// Not a playlist; the input itself is the locator.
    Single,
    /// Entry locators in playlist order.
    Playlist(Vec<String>),
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve one item to its current source URL and display title.
    async fn resolve(&self, locator: &str) -> Result<ResolvedMedia, ResolutionError>;

    /// Flat listing of `input`: playlist entries, or `Single`.
    async fn expand(&self, input: &str) -> Result<Expansion, ResolutionError>;
}

// ── yt-dlp JSON ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    /// Present for split audio/video formats
    #[serde(default)]
    requested_formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlatInfo {
    #[serde(default)]
    entries: Option<Vec<Option<FlatEntry>>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
}

impl FlatEntry {
    /// Definitive locator for one playlist entry.
    fn locator(&self) -> Option<String> {
        let is_http = |u: &&String| u.starts_with("http://") || u.starts_with("https://");
        self.webpage_url
            .as_ref()
            .filter(is_http)
            .or_else(|| self.url.as_ref().filter(is_http))
            .cloned()
            .or_else(|| {
                self.id
                    .as_ref()
                    .map(|id| format!("https://www.youtube.com/watch?v={}", id))
            })
    }
}

fn parse_media(locator: &str, json: &[u8]) -> Result<ResolvedMedia, ResolutionError> {
    let info: MediaInfo = serde_json::from_slice(json).map_err(|source| ResolutionError::Parse {
        locator: locator.to_string(),
        source,
    })?;
    let url = info
        .url
        .or_else(|| info.requested_formats.into_iter().find_map(|f| f.url))
        .ok_or_else(|| ResolutionError::NoUrl(locator.to_string()))?;
    let title = info
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_TITLE.to_string());
    Ok(ResolvedMedia { url, title })
}

fn parse_listing(input: &str, json: &[u8]) -> Result<Expansion, ResolutionError> {
    let info: FlatInfo = serde_json::from_slice(json).map_err(|source| ResolutionError::Parse {
        locator: input.to_string(),
        source,
    })?;
    Ok(match info.entries {
        None => Expansion::Single,
        Some(entries) => Expansion::Playlist(
            entries
                .iter()
                .flatten()
                .filter_map(FlatEntry::locator)
                .collect(),
        ),
    })
}

// ── YtDlpResolver ─────────────────────────────────────────────────────────────

pub struct YtDlpResolver {
    binary: PathBuf,
}

impl YtDlpResolver {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn locate(configured: Option<PathBuf>) -> anyhow::Result<Self> {
        let binary = configured
            .filter(|p| p.exists())
            .or_else(relay_proto::platform::find_yt_dlp_binary)
            .ok_or_else(|| anyhow::anyhow!("yt-dlp binary not found (set YT_DLP_PATH or tools.yt_dlp)"))?;
        Ok(Self::new(binary))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn dump_json(&self, locator: &str, args: &[&str]) -> Result<Vec<u8>, ResolutionError> {
        debug!("resolver: yt-dlp {:?} {}", args, locator);
        let output = Command::new(&self.binary)
            .args(["-J", "--no-warnings", "--quiet"])
            .args(args)
            .arg("--")
            .arg(locator)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        // --ignore-errors can exit non-zero while still printing a listing
        if !output.status.success() && output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output")
                .trim()
                .to_string();
            return Err(ResolutionError::Failed {
                locator: locator.to_string(),
                message,
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, locator: &str) -> Result<ResolvedMedia, ResolutionError> {
        let json = self
            .dump_json(locator, &["-f", "bestaudio/best", "--no-playlist"])
            .await?;
        let media = parse_media(locator, &json)?;
        info!("resolver: '{}' -> '{}'", locator, media.title);
        Ok(media)
    }

    async fn expand(&self, input: &str) -> Result<Expansion, ResolutionError> {
        let json = self
            .dump_json(input, &["--flat-playlist", "--ignore-errors"])
            .await?;
        let expansion = parse_listing(input, &json)?;
        if let Expansion::Playlist(entries) = &expansion {
            info!("resolver: '{}' lists {} entries", input, entries.len());
        }
        Ok(expansion)
    }
}
