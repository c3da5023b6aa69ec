use serde::{Deserialize, Serialize};

/// Phase of the current play cycle.
///
/// Transitions are strictly `Idle -> Buffering -> Streaming -> Idle`, with
/// `Buffering -> Idle` when the device never starts playing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Idle,
    Buffering,
    Streaming,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Buffering => "buffering",
            StreamState::Streaming => "streaming",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending entry of the play queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    /// Definitive per-item locator, re-resolved at play time.
    pub locator: String,
    pub title: String,
}

impl QueueItem {
    pub fn new(locator: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            title: title.into(),
        }
    }
}

/// Point-in-time copy of the shared playback state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlaybackSnapshot {
    /// Monotonic revision counter, incremented on every mutation.
    pub rev: u64,
    pub state: StreamState,
    /// Empty iff `state == Idle`.
    pub title: String,
    /// Resolved source URL; only present while a cycle holds it.
    pub source: Option<String>,
}

/// What the status feed pushes to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub state: StreamState,
    pub current: String,
    pub queue: Vec<String>,
}

// ── Control API bodies ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeRequest {
    #[serde(default)]
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemoveRequest {
    #[serde(default)]
    pub index: Option<i64>,
}

/// `{"status": "ok"}` / `{"status": "error", "msg": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<usize>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            msg: None,
            added: None,
        }
    }

    pub fn added(count: usize) -> Self {
        Self {
            added: Some(count),
            ..Self::ok()
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            msg: Some(msg.into()),
            added: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
