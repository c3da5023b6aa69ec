/// Playback orchestrator: the single consumer of the play queue.
///
/// One cycle per item, strictly sequential:
///
/// ```text
///   dequeue ──► Buffering: resolve, set volume, play_uri(stream url)
///                  │ poll transport every start_poll
///                  ├── Playing within start_timeout ──► Streaming
///                  │                                      │ poll every playing_poll
///                  │                                      └── not Playing ──► Idle
///                  └── timeout ──► Idle (failed to start)
/// ```
///
/// Any resolver or device error abandons the cycle; the state always returns
/// to Idle and the loop moves on to the next item.  Waits are cancellable
/// through the cycle token that `Controller::stop` fires.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_proto::config::PlaybackConfig;
use relay_proto::protocol::QueueItem;
use relay_proto::state::CycleId;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control::RelayContext;
use crate::device::{DeviceError, TransportState};
use crate::resolver::ResolutionError;

#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    pub start_poll: Duration,
    pub start_timeout: Duration,
    pub playing_poll: Duration,
}

impl From<&PlaybackConfig> for CycleTiming {
    fn from(cfg: &PlaybackConfig) -> Self {
        Self {
            start_poll: cfg.start_poll(),
            start_timeout: cfg.start_timeout(),
            playing_poll: cfg.playing_poll(),
        }
    }
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

/// Token of the cycle in flight, shared with the stop path.
#[derive(Default)]
pub struct CycleControl {
    current: Mutex<CancellationToken>,
}

impl CycleControl {
    /// Fresh token for a new cycle.  Earlier stops do not carry over.
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock() = token.clone();
        token
    }

    /// Interrupt the cycle in flight, if any.
    pub fn cancel(&self) {
        self.current.lock().cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Played and the device left Playing.
    Finished,
    /// Device never reported Playing before the timeout.
    FailedToStart,
    /// Interrupted by an explicit stop.
    Stopped,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub struct Orchestrator {
    ctx: RelayContext,
    stream_url: String,
    timing: CycleTiming,
}

impl Orchestrator {
    pub fn new(ctx: RelayContext, stream_url: String, timing: CycleTiming) -> Self {
        Self {
            ctx,
            stream_url,
            timing,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume the queue forever.
    pub async fn run(self) {
        info!("orchestrator: waiting for queue items");
        loop {
            let (item, cycle) = self.ctx.queue.dequeue_into(&self.ctx.playback).await;
            // Errors are already logged and contained to the item
            let _ = self.run_cycle(item, cycle).await;
        }
    }

    /// One full cycle for `item`.  The state is Idle again when this returns.
    pub async fn play_item(&self, item: QueueItem) -> Result<CycleOutcome, CycleError> {
        let cycle = self.ctx.playback.begin_cycle(&item.title).await;
        self.run_cycle(item, cycle).await
    }

    async fn run_cycle(&self, item: QueueItem, cycle: CycleId) -> Result<CycleOutcome, CycleError> {
        // A stop landing before the token exists has already reset `cycle`,
        // so its writers refuse and the cycle ends as Stopped.
        let cancel = self.ctx.cycles.begin();
        info!("orchestrator: cycle {} start '{}'", cycle, item.title);

        let result = self.drive(cycle, &item, &cancel).await;
        match &result {
            Ok(CycleOutcome::Finished) => info!("orchestrator: cycle {} finished", cycle),
            Ok(CycleOutcome::FailedToStart) => warn!(
                "orchestrator: cycle {} failed to start within {:?}",
                cycle, self.timing.start_timeout
            ),
            Ok(CycleOutcome::Stopped) => info!("orchestrator: cycle {} stopped", cycle),
            Err(e) => error!("orchestrator: cycle {} abandoned: {}", cycle, e),
        }

        // Source cleared before the sessions go, so a late GET streams nothing
        self.ctx.playback.end_cycle(cycle).await;
        self.ctx.sessions.cancel_all();
        result
    }

    async fn drive(
        &self,
        cycle: CycleId,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let media = tokio::select! {
            _ = cancel.cancelled() => return Ok(CycleOutcome::Stopped),
            media = self.ctx.resolver.resolve(&item.locator) => media?,
        };
        if !self.ctx.playback.set_source(cycle, &media.url).await {
            return Ok(CycleOutcome::Stopped);
        }

        let volume = self.ctx.playback.volume().await;
        self.ctx.device.set_volume(volume).await?;
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Stopped);
        }
        self.ctx.device.play_uri(&self.stream_url, &item.title).await?;
        if cancel.is_cancelled() {
            // The stop may have reached the device before Play did
            if let Err(e) = self.ctx.device.stop().await {
                warn!("orchestrator: cycle {} stop after Play failed: {}", cycle, e);
            }
            return Ok(CycleOutcome::Stopped);
        }

        // Buffering -> Streaming
        let deadline = Instant::now() + self.timing.start_timeout;
        loop {
            if self.ctx.device.transport_state().await? == TransportState::Playing {
                break;
            }
            if Instant::now() >= deadline {
                return Ok(CycleOutcome::FailedToStart);
            }
            if !sleep_unless_cancelled(self.timing.start_poll, cancel).await {
                return Ok(CycleOutcome::Stopped);
            }
        }
        if !self.ctx.playback.mark_streaming(cycle).await {
            return Ok(CycleOutcome::Stopped);
        }

        // Streaming -> Idle
        loop {
            if !sleep_unless_cancelled(self.timing.playing_poll, cancel).await {
                return Ok(CycleOutcome::Stopped);
            }
            if self.ctx.device.transport_state().await? != TransportState::Playing {
                return Ok(CycleOutcome::Finished);
            }
        }
    }
}

/// False if the token fired before the sleep elapsed.
async fn sleep_unless_cancelled(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Controller;
    use crate::device::PlaybackDevice;
    use crate::session::SessionRegistry;
    use crate::testing::{Behaviour, DeviceCall, FakeDevice, FakeResolver};
    use relay_proto::protocol::{PlaybackSnapshot, StreamState};
    use relay_proto::queue::QueueStore;
    use relay_proto::state::PlaybackState;
    use tokio::sync::broadcast;

    const STREAM_URL: &str = "http://10.0.0.2:8002/stream.mp3";

    struct Harness {
        ctx: RelayContext,
        device: Arc<FakeDevice>,
        resolver: Arc<FakeResolver>,
        controller: Controller,
    }

    fn harness(behaviour: Behaviour) -> Harness {
        let device = Arc::new(FakeDevice::new(behaviour));
        let resolver = Arc::new(FakeResolver::new());
        let ctx = RelayContext {
            queue: Arc::new(QueueStore::new()),
            playback: Arc::new(PlaybackState::new(20)),
            device: device.clone(),
            resolver: resolver.clone(),
            sessions: SessionRegistry::new(),
            cycles: Arc::new(CycleControl::default()),
        };
        let controller = Controller::new(ctx.clone());
        Harness {
            ctx,
            device,
            resolver,
            controller,
        }
    }

    fn fast() -> CycleTiming {
        CycleTiming {
            start_poll: Duration::from_millis(5),
            start_timeout: Duration::from_millis(300),
            playing_poll: Duration::from_millis(5),
        }
    }

    fn orchestrator(h: &Harness, timing: CycleTiming) -> Orchestrator {
        Orchestrator::new(h.ctx.clone(), STREAM_URL.to_string(), timing)
    }

    fn drain(rx: &mut broadcast::Receiver<PlaybackSnapshot>) -> Vec<PlaybackSnapshot> {
        let mut out = Vec::new();
        while let Ok(s) = rx.try_recv() {
            out.push(s);
        }
        out
    }

    async fn wait_for_state(
        rx: &mut broadcast::Receiver<PlaybackSnapshot>,
        seen: &mut Vec<PlaybackSnapshot>,
        want: impl Fn(&PlaybackSnapshot) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let s = rx.recv().await.unwrap();
                let done = want(&s);
                seen.push(s);
                if done {
                    return;
                }
            }
        })
        .await
        .expect("state never reached");
    }

    fn states(seen: &[PlaybackSnapshot]) -> Vec<(StreamState, String)> {
        let mut out: Vec<(StreamState, String)> = Vec::new();
        for s in seen {
            let entry = (s.state, s.title.clone());
            if out.last() != Some(&entry) {
                out.push(entry);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_two_items_play_in_order() {
        let h = harness(Behaviour::PlaysFor(3));
        assert_eq!(h.controller.enqueue("videoA,videoB").await.unwrap(), 2);
        assert_eq!(h.ctx.queue.titles().await, vec!["videoA", "videoB"]);

        let mut rx = h.ctx.playback.subscribe();
        let handle = orchestrator(&h, fast()).spawn();

        let mut seen = Vec::new();
        wait_for_state(&mut rx, &mut seen, |s| {
            s.state == StreamState::Buffering && s.title == "videoB"
        })
        .await;
        handle.abort();

        assert_eq!(
            states(&seen),
            vec![
                (StreamState::Buffering, "videoA".to_string()),
                (StreamState::Streaming, "videoA".to_string()),
                (StreamState::Idle, String::new()),
                (StreamState::Buffering, "videoB".to_string()),
            ]
        );
        for s in &seen {
            assert_eq!(s.title.is_empty(), s.state == StreamState::Idle);
        }
        assert!(h.ctx.queue.is_empty().await, "videoB should have been dequeued");
        assert_eq!(h.device.played_uris()[0], STREAM_URL);
        assert_eq!(h.device.played_titles()[0], "videoA");
    }

    #[tokio::test]
    async fn test_source_is_set_while_buffering_and_cleared_after() {
        let h = harness(Behaviour::PlaysFor(2));
        let mut rx = h.ctx.playback.subscribe();

        let outcome = orchestrator(&h, fast())
            .play_item(QueueItem::new("videoA", "videoA"))
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Finished);

        let seen = drain(&mut rx);
        let with_source = seen.iter().find(|s| s.source.is_some()).unwrap();
        assert_eq!(with_source.source.as_deref(), Some("https://media.test/videoA"));
        assert_eq!(with_source.state, StreamState::Buffering);

        let last = h.ctx.playback.snapshot().await;
        assert_eq!(last.state, StreamState::Idle);
        assert!(last.source.is_none());
    }

    #[tokio::test]
    async fn test_never_playing_goes_back_to_idle_without_streaming() {
        let h = harness(Behaviour::NeverStarts);
        let mut rx = h.ctx.playback.subscribe();
        let timing = CycleTiming {
            start_timeout: Duration::from_millis(40),
            ..fast()
        };

        let outcome = orchestrator(&h, timing)
            .play_item(QueueItem::new("videoA", "videoA"))
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::FailedToStart);

        let seen = drain(&mut rx);
        assert!(seen.iter().all(|s| s.state != StreamState::Streaming));
        assert_eq!(
            states(&seen),
            vec![
                (StreamState::Buffering, "videoA".to_string()),
                (StreamState::Idle, String::new()),
            ]
        );
        assert!(h.device.poll_count() >= 2, "start wait should poll repeatedly");
    }

    #[tokio::test]
    async fn test_device_failure_abandons_cycle() {
        let h = harness(Behaviour::Unreachable);

        let result = orchestrator(&h, fast())
            .play_item(QueueItem::new("videoA", "videoA"))
            .await;
        assert!(matches!(result, Err(CycleError::Device(_))));

        let s = h.ctx.playback.snapshot().await;
        assert_eq!(s.state, StreamState::Idle);
        assert!(s.title.is_empty());
        assert!(s.source.is_none());

        // The next cycle is unaffected once the device is back
        h.device.set_behaviour(Behaviour::PlaysFor(1));
        let outcome = orchestrator(&h, fast())
            .play_item(QueueItem::new("videoB", "videoB"))
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Finished);
    }

    #[tokio::test]
    async fn test_bad_item_does_not_stall_the_queue() {
        let h = harness(Behaviour::PlaysFor(1));
        h.ctx.queue.enqueue(QueueItem::new("gone", "gone")).await;
        h.ctx.queue.enqueue(QueueItem::new("videoB", "videoB")).await;
        // Resolvable at enqueue time, not any more at play time
        h.resolver.break_locator("gone");

        let mut rx = h.ctx.playback.subscribe();
        let handle = orchestrator(&h, fast()).spawn();
        let mut seen = Vec::new();
        wait_for_state(&mut rx, &mut seen, |s| {
            s.state == StreamState::Streaming && s.title == "videoB"
        })
        .await;
        handle.abort();

        assert_eq!(h.device.played_titles(), vec!["videoB"]);
        assert_eq!(h.resolver.resolve_calls(), vec!["gone", "videoB"]);
    }

    #[tokio::test]
    async fn test_stop_interrupts_streaming_cycle() {
        let h = harness(Behaviour::PlaysUntilStopped);
        let mut rx = h.ctx.playback.subscribe();
        let orch = Arc::new(orchestrator(&h, fast()));

        let cycle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.play_item(QueueItem::new("videoA", "videoA")).await })
        };
        let mut seen = Vec::new();
        wait_for_state(&mut rx, &mut seen, |s| s.state == StreamState::Streaming).await;

        h.controller.stop().await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
            .await
            .expect("cycle ignored stop")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Stopped);

        let s = h.ctx.playback.snapshot().await;
        assert_eq!(s.state, StreamState::Idle);
        assert!(s.title.is_empty());
        assert!(h.device.calls().contains(&DeviceCall::Stop));

        // Idempotent
        h.controller.stop().await;
        assert_eq!(h.ctx.playback.snapshot().await.state, StreamState::Idle);
    }

    #[tokio::test]
    async fn test_stop_during_play_command_leaves_device_stopped() {
        let h = harness(Behaviour::PlaysUntilStopped);
        h.device.set_play_delay(Duration::from_millis(100));
        let mut rx = h.ctx.playback.subscribe();
        let orch = Arc::new(orchestrator(&h, fast()));

        let cycle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.play_item(QueueItem::new("videoA", "videoA")).await })
        };
        let mut seen = Vec::new();
        wait_for_state(&mut rx, &mut seen, |s| s.source.is_some()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Reaches the device while Play is still in flight
        h.controller.stop().await;
        let outcome = cycle.await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Stopped);

        let calls = h.device.calls();
        let play = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::PlayUri(..)))
            .unwrap();
        assert!(calls[..play].contains(&DeviceCall::Stop));
        assert_eq!(calls.last(), Some(&DeviceCall::Stop));
        assert_eq!(h.device.poll_count(), 0);
        assert_eq!(h.ctx.playback.snapshot().await.state, StreamState::Idle);
    }

    #[tokio::test]
    async fn test_stop_does_not_poison_next_cycle() {
        let h = harness(Behaviour::PlaysFor(1));
        h.controller.stop().await;

        let outcome = orchestrator(&h, fast())
            .play_item(QueueItem::new("videoA", "videoA"))
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Finished);
    }

    #[tokio::test]
    async fn test_cycle_applies_current_volume_before_playing() {
        let h = harness(Behaviour::PlaysFor(1));
        h.controller.set_volume(35).await.unwrap();

        orchestrator(&h, fast())
            .play_item(QueueItem::new("videoA", "videoA"))
            .await
            .unwrap();

        let calls = h.device.calls();
        let vol = calls
            .iter()
            .rposition(|c| *c == DeviceCall::SetVolume(35))
            .unwrap();
        let play = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::PlayUri(..)))
            .unwrap();
        assert!(vol < play);
    }

    #[tokio::test]
    async fn test_removing_pending_entry_leaves_running_cycle_alone() {
        let h = harness(Behaviour::PlaysUntilStopped);
        h.controller.enqueue("videoA,videoB,videoC").await.unwrap();

        let mut rx = h.ctx.playback.subscribe();
        let handle = orchestrator(&h, fast()).spawn();
        let mut seen = Vec::new();
        wait_for_state(&mut rx, &mut seen, |s| s.state == StreamState::Streaming).await;

        let removed = h.controller.remove_from_queue(0).await.unwrap();
        assert_eq!(removed.title, "videoB");
        assert_eq!(h.ctx.queue.titles().await, vec!["videoC"]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let s = h.ctx.playback.snapshot().await;
        assert_eq!(s.state, StreamState::Streaming);
        assert_eq!(s.title, "videoA");
        handle.abort();

        let device: Arc<dyn PlaybackDevice> = h.device.clone();
        assert_eq!(
            device.transport_state().await.unwrap(),
            TransportState::Playing
        );
    }
}
