//! Fakes for the external collaborators, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::device::{DeviceError, PlaybackDevice, TransportState};
use crate::resolver::{Expansion, ResolutionError, ResolvedMedia, Resolver};
use crate::transcoder::Transcoder;

// ── transcoder ────────────────────────────────────────────────────────────────

/// Runs a shell snippet instead of ffmpeg; the input URL is passed as `$1`.
pub struct ScriptTranscoder {
    script: String,
    spawns: AtomicUsize,
    last_input: Mutex<Option<String>>,
}

impl ScriptTranscoder {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            spawns: AtomicUsize::new(0),
            last_input: Mutex::new(None),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<String> {
        self.last_input.lock().clone()
    }
}

impl Transcoder for ScriptTranscoder {
    fn command(&self, input_url: &str) -> Command {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock() = Some(input_url.to_string());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.script).arg("transcoder").arg(input_url);
        cmd
    }
}

// ── resolver ──────────────────────────────────────────────────────────────────

/// Resolves `name` to `https://media.test/<name>` titled `name`, unless the
/// name was marked broken.  Playlists are registered explicitly.
#[derive(Default)]
pub struct FakeResolver {
    broken: Mutex<Vec<String>>,
    playlists: Mutex<HashMap<String, Vec<String>>>,
    resolve_calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_locator(&self, locator: &str) {
        self.broken.lock().push(locator.to_string());
    }

    pub fn add_playlist(&self, input: &str, entries: &[&str]) {
        self.playlists.lock().insert(
            input.to_string(),
            entries.iter().map(|e| e.to_string()).collect(),
        );
    }

    pub fn resolve_calls(&self) -> Vec<String> {
        self.resolve_calls.lock().clone()
    }

    fn is_broken(&self, locator: &str) -> bool {
        self.broken.lock().iter().any(|b| b == locator)
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self, locator: &str) -> Result<ResolvedMedia, ResolutionError> {
        self.resolve_calls.lock().push(locator.to_string());
        if self.is_broken(locator) {
            return Err(ResolutionError::Failed {
                locator: locator.to_string(),
                message: "Video unavailable".to_string(),
            });
        }
        Ok(ResolvedMedia {
            url: format!("https://media.test/{}", locator),
            title: locator.to_string(),
        })
    }

    async fn expand(&self, input: &str) -> Result<Expansion, ResolutionError> {
        if self.is_broken(input) {
            return Err(ResolutionError::Failed {
                locator: input.to_string(),
                message: "Unsupported URL".to_string(),
            });
        }
        Ok(match self.playlists.lock().get(input) {
            Some(entries) => Expansion::Playlist(entries.clone()),
            None => Expansion::Single,
        })
    }
}

// ── device ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    SetVolume(u8),
    PlayUri(String, String),
    Stop,
}

/// How the fake speaker reacts to `play_uri`.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Reports Playing for this many polls, then Stopped.
    PlaysFor(usize),
    /// Keeps reporting Playing until `stop()`.
    PlaysUntilStopped,
    /// Never leaves Stopped.
    NeverStarts,
    /// `set_volume` and `play_uri` fail as unreachable.
    Unreachable,
}

struct DeviceInner {
    behaviour: Behaviour,
    playing_polls_left: Option<usize>,
    calls: Vec<DeviceCall>,
    polls: usize,
    play_delay: Duration,
}

pub struct FakeDevice {
    inner: Mutex<DeviceInner>,
}

impl FakeDevice {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                behaviour,
                playing_polls_left: None,
                calls: Vec::new(),
                polls: 0,
                play_delay: Duration::ZERO,
            }),
        }
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        self.inner.lock().behaviour = behaviour;
    }

    /// `play_uri` takes this long before the device acts on it.
    pub fn set_play_delay(&self, delay: Duration) {
        self.inner.lock().play_delay = delay;
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.inner.lock().calls.clone()
    }

    pub fn played_uris(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::PlayUri(uri, _) => Some(uri),
                _ => None,
            })
            .collect()
    }

    pub fn played_titles(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::PlayUri(_, title) => Some(title),
                _ => None,
            })
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.inner.lock().polls
    }
}

fn unreachable() -> DeviceError {
    DeviceError::Fault("fake device unreachable".to_string())
}

#[async_trait]
impl PlaybackDevice for FakeDevice {
    async fn set_volume(&self, level: u8) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if matches!(inner.behaviour, Behaviour::Unreachable) {
            return Err(unreachable());
        }
        inner.calls.push(DeviceCall::SetVolume(level.min(100)));
        Ok(())
    }

    async fn play_uri(&self, uri: &str, title: &str) -> Result<(), DeviceError> {
        let delay = self.inner.lock().play_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(DeviceCall::PlayUri(uri.to_string(), title.to_string()));
        inner.playing_polls_left = match inner.behaviour {
            Behaviour::PlaysFor(n) => Some(n),
            Behaviour::PlaysUntilStopped => Some(usize::MAX),
            Behaviour::NeverStarts => None,
            Behaviour::Unreachable => return Err(unreachable()),
        };
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.calls.push(DeviceCall::Stop);
        inner.playing_polls_left = None;
        Ok(())
    }

    async fn transport_state(&self) -> Result<TransportState, DeviceError> {
        let mut inner = self.inner.lock();
        inner.polls += 1;
        match inner.playing_polls_left {
            Some(0) | None => {
                inner.playing_polls_left = None;
                Ok(TransportState::Stopped)
            }
            Some(n) => {
                inner.playing_polls_left = Some(n.saturating_sub(1));
                Ok(TransportState::Playing)
            }
        }
    }
}
