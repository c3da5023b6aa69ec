use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// The network speaker that is driven by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host or IP of the group coordinator.  Empty means "not configured".
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_volume")]
    pub default_volume: u8,
}

/// Media proxy listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_stream_port")]
    pub port: u16,
    /// Host put into the URL handed to the device.  Detected when unset.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

/// Control API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

/// Polling cadence of the play cycle and the status feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_start_poll_ms")]
    pub start_poll_ms: u64,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_playing_poll_ms")]
    pub playing_poll_ms: u64,
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
}

/// Optional explicit paths for the external binaries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg: Option<PathBuf>,
    #[serde(default)]
    pub yt_dlp: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            default_volume: default_volume(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_stream_port(),
            advertise_host: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_poll_ms: default_start_poll_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            playing_poll_ms: default_playing_poll_ms(),
            status_poll_ms: default_status_poll_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn start_poll(&self) -> Duration {
        Duration::from_millis(self.start_poll_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn playing_poll(&self) -> Duration {
        Duration::from_millis(self.playing_poll_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

fn default_volume() -> u8 {
    20
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_stream_port() -> u16 {
    8002
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    8001
}

fn default_start_poll_ms() -> u64 {
    200
}

fn default_start_timeout_secs() -> u64 {
    10
}

fn default_playing_poll_ms() -> u64 {
    1000
}

fn default_status_poll_ms() -> u64 {
    100
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save()?;
            config
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// `SONOS_IP`, `STREAM_PORT` and `WEB_PORT` win over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = lookup("SONOS_IP") {
            self.device.address = ip.trim().to_string();
        }
        if let Some(port) = lookup("STREAM_PORT") {
            self.stream.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid STREAM_PORT '{}': {}", port, e))?;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.http.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid WEB_PORT '{}': {}", port, e))?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.stream.port == 0 {
            anyhow::bail!("stream.port must be non-zero");
        }
        if self.http.enabled && self.http.port == 0 {
            anyhow::bail!("http.port must be non-zero");
        }
        if self.http.enabled
            && self.http.port == self.stream.port
            && self.http.bind_address == self.stream.bind_address
        {
            anyhow::bail!("http and stream listeners cannot share port {}", self.stream.port);
        }
        self.device.default_volume = self.device.default_volume.min(100);
        Ok(())
    }
}
