//! Status Notifier: pushes a status snapshot to observers whenever the
//! (state, current title, queue titles) triple differs from the last one sent.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use relay_proto::protocol::StatusSnapshot;
use tokio::time::MissedTickBehavior;

use crate::control::Controller;

/// Change detection for one observer.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<StatusSnapshot>,
}

impl StatusTracker {
    /// `Some` when `snapshot` should be emitted.  The first observation
    /// always is.
    pub fn observe(&mut self, snapshot: StatusSnapshot) -> Option<StatusSnapshot> {
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }
}

/// Poll the controller every `period` and yield only changed snapshots.
/// Ends when the consumer drops it.
pub fn status_stream(
    controller: Arc<Controller>,
    period: Duration,
) -> impl Stream<Item = StatusSnapshot> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    futures_util::stream::unfold(
        (controller, ticker, StatusTracker::default()),
        |(controller, mut ticker, mut tracker)| async move {
            loop {
                ticker.tick().await;
                if let Some(snapshot) = tracker.observe(controller.status().await) {
                    return Some((snapshot, (controller, ticker, tracker)));
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RelayContext;
    use crate::orchestrator::CycleControl;
    use crate::session::SessionRegistry;
    use crate::testing::{Behaviour, FakeDevice, FakeResolver};
    use futures_util::StreamExt;
    use relay_proto::protocol::StreamState;
    use relay_proto::queue::QueueStore;
    use relay_proto::state::PlaybackState;

    fn status(state: StreamState, current: &str, queue: &[&str]) -> StatusSnapshot {
        StatusSnapshot {
            state,
            current: current.to_string(),
            queue: queue.iter().map(|q| q.to_string()).collect(),
        }
    }

    #[test]
    fn test_tracker_emits_only_distinct_consecutive_snapshots() {
        let observed = vec![
            status(StreamState::Idle, "", &[]),
            status(StreamState::Idle, "", &[]),
            status(StreamState::Idle, "", &["a"]),
            status(StreamState::Buffering, "a", &[]),
            status(StreamState::Buffering, "a", &[]),
            status(StreamState::Streaming, "a", &[]),
            status(StreamState::Streaming, "a", &[]),
            status(StreamState::Streaming, "a", &[]),
            status(StreamState::Idle, "", &[]),
        ];
        let mut tracker = StatusTracker::default();
        let emitted: Vec<_> = observed
            .into_iter()
            .filter_map(|s| tracker.observe(s))
            .collect();

        assert_eq!(
            emitted,
            vec![
                status(StreamState::Idle, "", &[]),
                status(StreamState::Idle, "", &["a"]),
                status(StreamState::Buffering, "a", &[]),
                status(StreamState::Streaming, "a", &[]),
                status(StreamState::Idle, "", &[]),
            ]
        );
    }

    #[test]
    fn test_tracker_notices_queue_reorder() {
        let mut tracker = StatusTracker::default();
        assert!(tracker.observe(status(StreamState::Idle, "", &["a", "b"])).is_some());
        assert!(tracker.observe(status(StreamState::Idle, "", &["b", "a"])).is_some());
        assert!(tracker.observe(status(StreamState::Idle, "", &["b", "a"])).is_none());
    }

    async fn next_status<S>(stream: &mut S) -> StatusSnapshot
    where
        S: Stream<Item = StatusSnapshot> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("no status emitted")
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_follows_mutations_without_repeats() {
        let ctx = RelayContext {
            queue: Arc::new(QueueStore::new()),
            playback: Arc::new(PlaybackState::new(20)),
            device: Arc::new(FakeDevice::new(Behaviour::NeverStarts)),
            resolver: Arc::new(FakeResolver::new()),
            sessions: SessionRegistry::new(),
            cycles: Arc::new(CycleControl::default()),
        };
        let controller = Arc::new(Controller::new(ctx.clone()));
        let mut stream = Box::pin(status_stream(controller.clone(), Duration::from_millis(5)));

        assert_eq!(next_status(&mut stream).await, status(StreamState::Idle, "", &[]));

        controller.enqueue("a").await.unwrap();
        assert_eq!(next_status(&mut stream).await, status(StreamState::Idle, "", &["a"]));

        let item = ctx.queue.dequeue().await;
        let cycle = ctx.playback.begin_cycle(&item.title).await;
        assert_eq!(next_status(&mut stream).await, status(StreamState::Buffering, "a", &[]));

        // Source change alone is not part of the status triple
        ctx.playback.set_source(cycle, "https://media.test/a").await;
        ctx.playback.mark_streaming(cycle).await;
        assert_eq!(next_status(&mut stream).await, status(StreamState::Streaming, "a", &[]));

        ctx.playback.end_cycle(cycle).await;
        assert_eq!(next_status(&mut stream).await, status(StreamState::Idle, "", &[]));
    }
}
