/// Stream sessions: one transcoder child process per proxied connection.
///
/// ```text
///   proxy GET ──► SessionRegistry::start(cmd)
///                     │ spawn child (stdout piped, kill_on_drop)
///                     └── pump task ── 1 KiB chunks ──► mpsc ──► response body
/// ```
///
/// The pump owns the child.  It stops on transcoder EOF, read error, client
/// disconnect (receiver dropped) or `cancel_all()`, and on every one of those
/// paths it kills and reaps the child *before* dropping the sender, so the
/// body only observes end-of-stream once the process is gone.
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Forwarding granularity between transcoder and connection.
pub const CHUNK_SIZE: usize = 1024;

/// Chunks buffered between the pump and a slow connection.
const CHANNEL_DEPTH: usize = 16;

/// Grace period for a transcoder that closed stdout to exit on its own.
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub type SessionReceiver = mpsc::Receiver<io::Result<Bytes>>;

#[derive(Default)]
pub struct SessionRegistry {
    /// Parent of every live session token; swapped out by `cancel_all`.
    cancel: Mutex<CancellationToken>,
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn `command` and start pumping its stdout.
    pub fn start(self: &Arc<Self>, mut command: Command) -> io::Result<SessionReceiver> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transcoder stdout not captured"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = SessionGuard {
            registry: Arc::clone(self),
            id,
        };
        let cancel = self.cancel.lock().child_token();

        info!("session {}: transcoder started (pid {:?})", id, child.id());

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(pump(id, child, stdout, tx, cancel, guard));
        Ok(rx)
    }

    /// Terminate every session that is currently running.
    pub fn cancel_all(&self) {
        let old = std::mem::take(&mut *self.cancel.lock());
        let active = self.active_count();
        if active > 0 {
            info!("sessions: cancelling {} active session(s)", active);
        }
        old.cancel();
    }

    /// Sessions whose child has not been reaped yet.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Transcoder processes spawned since startup.
    pub fn spawned_count(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

/// Keeps `active` honest even if the pump task panics.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::SeqCst);
        debug!("session {}: released", self.id);
    }
}

#[derive(Debug)]
enum SessionEnd {
    Eof,
    ReadError(io::Error),
    ClientGone,
    Cancelled,
}

async fn pump(
    id: u64,
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    guard: SessionGuard,
) {
    let mut reader = ReaderStream::with_capacity(stdout, CHUNK_SIZE);
    let mut sent: u64 = 0;

    let end = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            _ = tx.closed() => break SessionEnd::ClientGone,
            next = reader.next() => next,
        };
        let chunk = match next {
            None => break SessionEnd::Eof,
            Some(Err(e)) => break SessionEnd::ReadError(e),
            Some(Ok(chunk)) => chunk,
        };
        sent += chunk.len() as u64;
        tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            res = tx.send(Ok(chunk)) => {
                if res.is_err() {
                    break SessionEnd::ClientGone;
                }
            }
        }
    };
    drop(reader);

    let status = terminate(&mut child, matches!(end, SessionEnd::Eof)).await;

    match &end {
        SessionEnd::Eof => {
            let failed = sent == 0 || status.map(|s| !s.success()).unwrap_or(true);
            if failed {
                warn!(
                    "session {}: transcode failure ({} bytes, exit {:?})",
                    id, sent, status
                );
            } else {
                info!("session {}: transcoder finished after {} bytes", id, sent);
            }
        }
        SessionEnd::ReadError(e) => {
            warn!("session {}: transcoder read error after {} bytes: {}", id, sent, e)
        }
        SessionEnd::ClientGone => debug!("session {}: client disconnected after {} bytes", id, sent),
        SessionEnd::Cancelled => info!("session {}: stopped after {} bytes", id, sent),
    }

    drop(guard);
    drop(tx);
}

/// Make sure the child is gone.  After a clean EOF it gets a short grace
/// period to exit by itself so its real status can be reported.
async fn terminate(child: &mut Child, graceful: bool) -> Option<ExitStatus> {
    if graceful {
        if let Ok(Ok(status)) = tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            return Some(status);
        }
    }
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    if let Err(e) = child.kill().await {
        warn!("session: failed to kill transcoder: {}", e);
    }
    child.wait().await.ok()
}
