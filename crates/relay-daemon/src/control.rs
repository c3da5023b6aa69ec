//! Control-surface operations shared by the HTTP API and the tests.

use std::sync::Arc;

use relay_proto::protocol::{QueueItem, StatusSnapshot};
use relay_proto::queue::{QueueError, QueueStore};
use relay_proto::state::PlaybackState;
use thiserror::Error;
use tracing::{info, warn};

use crate::device::{DeviceError, PlaybackDevice};
use crate::orchestrator::CycleControl;
use crate::resolver::{Expansion, ResolutionError, Resolver};
use crate::session::SessionRegistry;

/// Everything the orchestrator and the control surface share.
#[derive(Clone)]
pub struct RelayContext {
    pub queue: Arc<QueueStore>,
    pub playback: Arc<PlaybackState>,
    pub device: Arc<dyn PlaybackDevice>,
    pub resolver: Arc<dyn Resolver>,
    pub sessions: Arc<SessionRegistry>,
    pub cycles: Arc<CycleControl>,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("No URL provided")]
    Empty,
    #[error("Failed to extract URL/playlist")]
    Resolution(#[source] ResolutionError),
}

pub struct Controller {
    ctx: RelayContext,
}

impl Controller {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx }
    }

    /// Resolve `input` and append every playable entry.  Returns how many
    /// items were added.
    ///
    /// `input` is a comma-separated list of locators, each of which may be a
    /// playlist.  Parts and entries that fail to resolve are skipped; the
    /// request only fails when not a single part could be listed.
    pub async fn enqueue(&self, input: &str) -> Result<usize, EnqueueError> {
        let parts: Vec<&str> = input
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(EnqueueError::Empty);
        }

        let mut locators = Vec::new();
        let mut listed = 0;
        let mut last_error = None;
        for part in &parts {
            match self.ctx.resolver.expand(part).await {
                Ok(Expansion::Single) => locators.push(part.to_string()),
                Ok(Expansion::Playlist(entries)) => locators.extend(entries),
                Err(e) => {
                    warn!("enqueue: cannot list '{}': {}", part, e);
                    last_error = Some(e);
                    continue;
                }
            }
            listed += 1;
        }
        if listed == 0 {
            if let Some(e) = last_error {
                return Err(EnqueueError::Resolution(e));
            }
        }

        let mut added = 0;
        for locator in locators {
            match self.ctx.resolver.resolve(&locator).await {
                Ok(media) => {
                    info!("enqueue: added '{}'", media.title);
                    self.ctx.queue.enqueue(QueueItem::new(locator, media.title)).await;
                    added += 1;
                }
                Err(e) => warn!("enqueue: skipping '{}': {}", locator, e),
            }
        }
        Ok(added)
    }

    /// Halt whatever is playing.  Safe to call at any time, any number of
    /// times; the queue is left as is.
    pub async fn stop(&self) {
        info!("control: stop");
        self.ctx.cycles.cancel();
        // Source cleared first: a GET landing after cancel_all gets nothing
        self.ctx.playback.reset().await;
        self.ctx.sessions.cancel_all();
        if let Err(e) = self.ctx.device.stop().await {
            warn!("control: device stop failed: {}", e);
        }
    }

    /// Store the level for future cycles and apply it now.
    pub async fn set_volume(&self, level: u8) -> Result<(), DeviceError> {
        let level = level.min(100);
        self.ctx.playback.set_volume(level).await;
        self.ctx.device.set_volume(level).await
    }

    pub async fn remove_from_queue(&self, index: i64) -> Result<QueueItem, QueueError> {
        let removed = self.ctx.queue.remove_at(index).await?;
        info!("control: removed '{}' from queue", removed.title);
        Ok(removed)
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.ctx.queue.status(&self.ctx.playback).await
    }
}
