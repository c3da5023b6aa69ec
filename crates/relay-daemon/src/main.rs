mod control;
mod device;
mod http;
mod notifier;
mod orchestrator;
mod proxy;
mod resolver;
mod session;
#[cfg(test)]
mod testing;
mod transcoder;

use std::sync::Arc;

use relay_proto::config::Config;
use relay_proto::queue::QueueStore;
use relay_proto::state::PlaybackState;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::control::{Controller, RelayContext};
use crate::device::SonosDevice;
use crate::orchestrator::{CycleControl, CycleTiming, Orchestrator};
use crate::resolver::YtDlpResolver;
use crate::session::SessionRegistry;
use crate::transcoder::FfmpegTranscoder;

/// Host the device should use to reach the media proxy.
fn advertise_host(config: &Config) -> String {
    if let Some(host) = config.stream.advertise_host.as_ref().filter(|h| !h.is_empty()) {
        return host.clone();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!("Could not detect local IP ({}), advertising 127.0.0.1", e);
            "127.0.0.1".to_string()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File logging + stderr
    let data_dir = relay_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,relay_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let transcoder = match FfmpegTranscoder::locate(config.tools.ffmpeg.clone()) {
        Ok(t) => t,
        Err(e) => {
            error!("{}", e);
            return Err(e);
        }
    };
    let resolver = YtDlpResolver::locate(config.tools.yt_dlp.clone())?;
    info!("Using yt-dlp at {:?}", resolver.binary());

    if config.device.address.is_empty() {
        warn!("No device address configured (device.address or SONOS_IP); playback will fail");
    }

    let host = advertise_host(&config);
    let stream_url = relay_proto::platform::stream_url(&host, config.stream.port);
    info!("Device will be pointed at {}", stream_url);

    let ctx = RelayContext {
        queue: Arc::new(QueueStore::new()),
        playback: Arc::new(PlaybackState::new(config.device.default_volume)),
        device: Arc::new(SonosDevice::new(config.device.address.clone())),
        resolver: Arc::new(resolver),
        sessions: SessionRegistry::new(),
        cycles: Arc::new(CycleControl::default()),
    };
    let controller = Arc::new(Controller::new(ctx.clone()));
    let sessions = ctx.sessions.clone();

    // Media proxy
    let _proxy_handle = proxy::start_server(
        config.stream.bind_address.clone(),
        config.stream.port,
        proxy::ProxyState {
            playback: ctx.playback.clone(),
            sessions: ctx.sessions.clone(),
            transcoder: Arc::new(transcoder),
        },
    );

    // Control API if enabled
    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                controller: controller.clone(),
                status_poll: config.playback.status_poll(),
                default_volume: config.device.default_volume,
            },
        );
    }

    let orchestrator = Orchestrator::new(ctx, stream_url, CycleTiming::from(&config.playback)).spawn();

    tokio::select! {
        res = orchestrator => {
            if let Err(e) = res {
                error!("Orchestrator task ended: {}", e);
            }
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        }
    }

    controller.stop().await;
    info!("Served {} stream session(s)", sessions.spawned_count());
    Ok(())
}
