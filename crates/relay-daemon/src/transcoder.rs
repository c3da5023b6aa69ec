use std::path::PathBuf;

use tokio::process::Command;

/// Builds the external command that turns one source URL into a live mp3
/// byte stream on stdout.  The proxy owns stdio wiring and teardown.
pub trait Transcoder: Send + Sync {
    fn command(&self, input_url: &str) -> Command;
}

/// ffmpeg in real-time mode, mp3 out on `pipe:1`.
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Explicit path if given, otherwise the usual platform lookup.
    pub fn locate(configured: Option<PathBuf>) -> anyhow::Result<Self> {
        let binary = configured
            .filter(|p| p.exists())
            .or_else(relay_proto::platform::find_ffmpeg_binary)
            .ok_or_else(|| anyhow::anyhow!("ffmpeg binary not found (set FFMPEG_PATH or tools.ffmpeg)"))?;
        Ok(Self::new(binary))
    }

    pub fn args(input_url: &str) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-re",
            "-i",
            input_url,
            "-vn",
            "-f",
            "mp3",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Transcoder for FfmpegTranscoder {
    fn command(&self, input_url: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::args(input_url));
        cmd
    }
}
