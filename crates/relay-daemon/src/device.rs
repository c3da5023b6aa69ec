//! Playback device adapter: UPnP/SOAP control of a Sonos group coordinator.
//!
//! The orchestrator only sees the `PlaybackDevice` trait; `SonosDevice`
//! speaks AVTransport / RenderingControl over plain HTTP.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-request timeout for SOAP calls.
const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff for transient SOAP faults.
const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not configured")]
    NotConfigured,
    #[error("device unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("device returned HTTP {0}")]
    HttpStatus(u16),
    #[error("SOAP fault: {0}")]
    Fault(String),
    #[error("unexpected device response")]
    Parse,
}

impl DeviceError {
    /// 701 transition not available, 714 illegal seek target, 716 resource
    /// not found: the device is busy switching and usually accepts a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DeviceError::Fault(msg) => {
                msg.contains("701") || msg.contains("714") || msg.contains("716")
            }
            DeviceError::Unreachable(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Transport state as far as the play cycle cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Playing,
    Stopped,
    /// Paused, transitioning, no media...
    Other,
}

impl TransportState {
    pub fn from_upnp(value: &str) -> Self {
        match value.trim() {
            "PLAYING" => TransportState::Playing,
            "STOPPED" => TransportState::Stopped,
            _ => TransportState::Other,
        }
    }
}

#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    /// Set the output level, 0..=100 (higher values are clamped).
    async fn set_volume(&self, level: u8) -> Result<(), DeviceError>;

    /// Point the device at `uri` and start playing it.
    async fn play_uri(&self, uri: &str, title: &str) -> Result<(), DeviceError>;

    async fn stop(&self) -> Result<(), DeviceError>;

    async fn transport_state(&self) -> Result<TransportState, DeviceError>;
}

// ── SOAP plumbing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    AVTransport,
    RenderingControl,
}

impl Service {
    fn urn(&self) -> &'static str {
        match self {
            Service::AVTransport => "urn:schemas-upnp-org:service:AVTransport:1",
            Service::RenderingControl => "urn:schemas-upnp-org:service:RenderingControl:1",
        }
    }

    fn control_path(&self) -> &'static str {
        match self {
            Service::AVTransport => "/MediaRenderer/AVTransport/Control",
            Service::RenderingControl => "/MediaRenderer/RenderingControl/Control",
        }
    }
}

pub(crate) fn escape_xml(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// Unescaped text of the first element named `tag` (namespace prefixes
/// ignored).  `None` if missing or empty.
pub(crate) fn extract_xml_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let tag = tag.as_bytes();
    let mut inside = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == tag => inside = true,
            Ok(Event::Text(e)) if inside => text.push_str(&e.unescape().ok()?),
            Ok(Event::CData(e)) if inside => text.push_str(&String::from_utf8_lossy(&e)),
            Ok(Event::End(e)) if inside && e.local_name().as_ref() == tag => {
                return (!text.is_empty()).then_some(text);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn soap_envelope(service: Service, action: &str, args: &[(&str, &str)]) -> String {
    // Single line, no whitespace before the root element
    let mut body = format!(
        r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{} xmlns:u="{}">"#,
        action,
        service.urn()
    );
    for (k, v) in args {
        body.push_str(&format!("<{k}>{}</{k}>", escape_xml(v)));
    }
    body.push_str(&format!("</u:{}></s:Body></s:Envelope>", action));
    body
}

/// Minimal DIDL-Lite so the speaker UI shows the track title.
fn didl_metadata(uri: &str, title: &str) -> String {
    format!(
        concat!(
            r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" "#,
            r#"xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" "#,
            r#"xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/">"#,
            r#"<item id="R:0/0/0" parentID="R:0/0" restricted="true">"#,
            "<dc:title>{}</dc:title>",
            "<upnp:class>object.item.audioItem.musicTrack</upnp:class>",
            r#"<res protocolInfo="http-get:*:audio/mpeg:*">{}</res>"#,
            "</item></DIDL-Lite>"
        ),
        escape_xml(title),
        escape_xml(uri)
    )
}

// ── SonosDevice ───────────────────────────────────────────────────────────────

pub struct SonosDevice {
    client: Client,
    address: String,
}

impl SonosDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            address: address.into(),
        }
    }

    fn base_url(&self) -> String {
        if self.address.contains(':') {
            format!("http://{}", self.address)
        } else {
            format!("http://{}:1400", self.address)
        }
    }

    async fn call(
        &self,
        service: Service,
        action: &str,
        args: &[(&str, &str)],
    ) -> Result<String, DeviceError> {
        if self.address.is_empty() {
            return Err(DeviceError::NotConfigured);
        }
        let url = format!("{}{}", self.base_url(), service.control_path());
        debug!("sonos: {} -> {}", action, url);

        let res = self
            .client
            .post(&url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", service.urn(), action))
            .body(soap_envelope(service, action, args))
            .timeout(SOAP_TIMEOUT)
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await?;

        // Faults usually come with a 500
        if text.contains("Fault>") {
            let code = extract_xml_text(&text, "errorCode");
            let fault = extract_xml_text(&text, "faultstring").unwrap_or_else(|| "unknown".into());
            let msg = match code {
                Some(code) => format!("{} ({})", fault, code),
                None => fault,
            };
            return Err(DeviceError::Fault(msg));
        }
        if !status.is_success() {
            return Err(DeviceError::HttpStatus(status.as_u16()));
        }
        Ok(text)
    }

    async fn call_with_retry(
        &self,
        service: Service,
        action: &str,
        args: &[(&str, &str)],
    ) -> Result<String, DeviceError> {
        let mut attempt = 0;
        loop {
            match self.call(service, action, args).await {
                Err(e) if e.is_transient() && attempt < RETRY_DELAYS_MS.len() => {
                    let delay = RETRY_DELAYS_MS[attempt];
                    attempt += 1;
                    warn!("sonos: {} transient error ({}), retry {} in {}ms", action, e, attempt, delay);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl PlaybackDevice for SonosDevice {
    async fn set_volume(&self, level: u8) -> Result<(), DeviceError> {
        let level = level.min(100).to_string();
        self.call(
            Service::RenderingControl,
            "SetVolume",
            &[("InstanceID", "0"), ("Channel", "Master"), ("DesiredVolume", &level)],
        )
        .await?;
        info!("sonos: volume set to {}", level);
        Ok(())
    }

    async fn play_uri(&self, uri: &str, title: &str) -> Result<(), DeviceError> {
        let metadata = didl_metadata(uri, title);
        info!("sonos: SetAVTransportURI {}", uri);
        self.call_with_retry(
            Service::AVTransport,
            "SetAVTransportURI",
            &[
                ("InstanceID", "0"),
                ("CurrentURI", uri),
                ("CurrentURIMetaData", &metadata),
            ],
        )
        .await?;
        self.call_with_retry(
            Service::AVTransport,
            "Play",
            &[("InstanceID", "0"), ("Speed", "1")],
        )
        .await?;
        info!("sonos: play command accepted");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        match self
            .call(Service::AVTransport, "Stop", &[("InstanceID", "0")])
            .await
        {
            Ok(_) => Ok(()),
            // 701: nothing to stop
            Err(DeviceError::Fault(msg)) if msg.contains("701") => {
                debug!("sonos: stop ignored, already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn transport_state(&self) -> Result<TransportState, DeviceError> {
        let response = self
            .call(Service::AVTransport, "GetTransportInfo", &[("InstanceID", "0")])
            .await?;
        extract_xml_text(&response, "CurrentTransportState")
            .map(|s| TransportState::from_upnp(&s))
            .ok_or(DeviceError::Parse)
    }
}
