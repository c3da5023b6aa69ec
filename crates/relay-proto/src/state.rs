use crate::protocol::{PlaybackSnapshot, StreamState};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Identifies one play cycle.  Writers must present it, so a cycle that was
/// already ended by `reset()` cannot move the state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CycleId(u64);

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Inner {
    rev: u64,
    state: StreamState,
    title: String,
    source: Option<String>,
    /// Cycle currently holding the state, `None` while Idle.
    cycle: Option<u64>,
    next_cycle: u64,
    volume: u8,
}

impl Inner {
    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            rev: self.rev,
            state: self.state,
            title: self.title.clone(),
            source: self.source.clone(),
        }
    }

    fn go_idle(&mut self) {
        self.state = StreamState::Idle;
        self.title.clear();
        self.source = None;
        self.cycle = None;
    }
}

/// Process-wide playback state.
///
/// Only the orchestrator (through a `CycleId`) and the stop path (`reset`)
/// write it; everyone else takes snapshots.  Every mutation bumps `rev` and
/// is published on a broadcast channel.
pub struct PlaybackState {
    inner: RwLock<Inner>,
    updates: broadcast::Sender<PlaybackSnapshot>,
}

pub const FALLBACK_TITLE: &str = "Unknown Title";

impl PlaybackState {
    pub fn new(volume: u8) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner {
                rev: 1,
                volume: volume.min(100),
                ..Inner::default()
            }),
            updates,
        }
    }

    pub async fn snapshot(&self) -> PlaybackSnapshot {
        self.inner.read().await.snapshot()
    }

    /// The resolved source for the active cycle, if any.
    pub async fn source(&self) -> Option<String> {
        self.inner.read().await.source.clone()
    }

    pub async fn volume(&self) -> u8 {
        self.inner.read().await.volume
    }

    pub async fn set_volume(&self, volume: u8) {
        let mut inner = self.inner.write().await;
        inner.volume = volume.min(100);
    }

    /// Receive every snapshot published after this call, in mutation order.
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackSnapshot> {
        self.updates.subscribe()
    }

    /// Idle -> Buffering.  Any cycle still holding the state is superseded.
    pub async fn begin_cycle(&self, title: &str) -> CycleId {
        let mut inner = self.inner.write().await;
        inner.next_cycle += 1;
        let id = inner.next_cycle;
        inner.cycle = Some(id);
        inner.state = StreamState::Buffering;
        inner.title = if title.trim().is_empty() {
            FALLBACK_TITLE.to_string()
        } else {
            title.to_string()
        };
        inner.source = None;
        self.publish(&mut inner);
        debug!("state: cycle #{} buffering '{}'", id, inner.title);
        CycleId(id)
    }

    /// Record the resolved source.  Returns false if the cycle is no longer current.
    pub async fn set_source(&self, cycle: CycleId, url: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.cycle != Some(cycle.0) {
            return false;
        }
        inner.source = Some(url.to_string());
        self.publish(&mut inner);
        true
    }

    /// Buffering -> Streaming.  Returns false if the cycle is no longer current.
    pub async fn mark_streaming(&self, cycle: CycleId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.cycle != Some(cycle.0) || inner.state != StreamState::Buffering {
            return false;
        }
        inner.state = StreamState::Streaming;
        self.publish(&mut inner);
        debug!("state: cycle #{} streaming", cycle.0);
        true
    }

    /// Back to Idle at the end of a cycle.  No-op if the cycle was already ended.
    pub async fn end_cycle(&self, cycle: CycleId) {
        let mut inner = self.inner.write().await;
        if inner.cycle != Some(cycle.0) {
            return;
        }
        inner.go_idle();
        self.publish(&mut inner);
        debug!("state: cycle #{} ended", cycle.0);
    }

    /// Unconditional return to Idle (explicit stop).
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == StreamState::Idle && inner.cycle.is_none() {
            return;
        }
        inner.go_idle();
        self.publish(&mut inner);
    }

    fn publish(&self, inner: &mut Inner) {
        inner.rev += 1;
        // No subscribers is fine
        let _ = self.updates.send(inner.snapshot());
    }
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::new(20)
    }
}
