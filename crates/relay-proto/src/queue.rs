//! Queue Store: the ordered set of items waiting to be played.
//!
//! Every operation takes the same lock, so a `remove_at` can never race a
//! `dequeue` into duplicating or dropping an item.  `dequeue` parks on a
//! `Notify` while the queue is empty; `enqueue` stores a permit even when no
//! one is waiting yet, so a wake-up is never lost.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::protocol::{QueueItem, StatusSnapshot};
use crate::state::{CycleId, PlaybackState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("index {index} out of range (queue has {len} items)")]
    OutOfRange { index: i64, len: usize },
}

#[derive(Debug, Default)]
pub struct QueueStore {
    items: Mutex<VecDeque<QueueItem>>,
    available: Notify,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail.  Never blocks on consumers.
    pub async fn enqueue(&self, item: QueueItem) {
        self.items.lock().await.push_back(item);
        self.available.notify_one();
    }

    /// Remove and return the head, waiting until one exists.
    pub async fn dequeue(&self) -> QueueItem {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`dequeue`](Self::dequeue), but the cycle for the item is begun
    /// before the queue lock is released.  Together with
    /// [`status`](Self::status) an observer never sees the head item neither
    /// queued nor playing.
    pub async fn dequeue_into(&self, playback: &PlaybackState) -> (QueueItem, CycleId) {
        loop {
            let notified = self.available.notified();
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    let cycle = playback.begin_cycle(&item.title).await;
                    return (item, cycle);
                }
            }
            notified.await;
        }
    }

    /// Playback state and pending titles read as one consistent view.
    pub async fn status(&self, playback: &PlaybackState) -> StatusSnapshot {
        let items = self.items.lock().await;
        let current = playback.snapshot().await;
        StatusSnapshot {
            state: current.state,
            current: current.title,
            queue: items.iter().map(|item| item.title.clone()).collect(),
        }
    }

    /// Non-waiting variant of [`dequeue`](Self::dequeue).
    pub async fn try_dequeue(&self) -> Option<QueueItem> {
        self.items.lock().await.pop_front()
    }

    /// Remove the entry at `index` of the current ordering.
    ///
    /// Takes a signed index because it arrives straight from clients.
    pub async fn remove_at(&self, index: i64) -> Result<QueueItem, QueueError> {
        let mut items = self.items.lock().await;
        let len = items.len();
        usize::try_from(index)
            .ok()
            .and_then(|i| items.remove(i))
            .ok_or(QueueError::OutOfRange { index, len })
    }

    pub async fn snapshot(&self) -> Vec<QueueItem> {
        self.items.lock().await.iter().cloned().collect()
    }

    pub async fn titles(&self) -> Vec<String> {
        self.items
            .lock()
            .await
            .iter()
            .map(|item| item.title.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}
