/// HTTP media proxy for the playback device.
///
/// Serves `GET /stream.mp3` on the stream port.  The device is told to play
/// `http://<host>:<port>/stream.mp3`; every GET while a resolved source is
/// set spawns a fresh transcoder and streams its output until EOF, stop or
/// disconnect (see `session`).
///
/// Design notes
/// ─────────────
/// • `HEAD` answers headers only and never spawns anything; devices probe the
///   URL before committing to playback.
/// • A GET with no source answers headers with an empty body instead of
///   holding the connection open against nothing.
/// • The source is read at request time.  A stale read (cycle ending right
///   now) just produces a short stream, never an error.
/// • Nothing here assumes a single connection; a stray second GET gets its
///   own independent session.
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use relay_proto::platform::STREAM_PATH;
use relay_proto::state::PlaybackState;
use tracing::{error, info, warn};

use crate::session::{SessionReceiver, SessionRegistry};
use crate::transcoder::Transcoder;

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ProxyState {
    pub playback: Arc<PlaybackState>,
    pub sessions: Arc<SessionRegistry>,
    pub transcoder: Arc<dyn Transcoder>,
}

// ── Route handler ─────────────────────────────────────────────────────────────

/// GET and HEAD both land here; axum would otherwise run the GET path (and
/// spawn a transcoder) for HEAD.
async fn stream_audio(method: Method, State(state): State<ProxyState>) -> Response {
    if method == Method::HEAD {
        return audio_response(Body::empty());
    }

    let Some(source) = state.playback.source().await else {
        info!("proxy: GET with no source set, answering empty");
        return audio_response(Body::empty());
    };

    info!(
        "proxy: starting transcoder for {} ({} already active)",
        source,
        state.sessions.active_count()
    );
    match state.sessions.start(state.transcoder.command(&source)) {
        Ok(rx) => audio_response(Body::from_stream(receiver_stream(rx))),
        Err(e) => {
            error!("proxy: failed to spawn transcoder: {}", e);
            audio_response(Body::empty())
        }
    }
}

fn audio_response(body: Body) -> Response {
    ([(header::CONTENT_TYPE, "audio/mpeg")], body).into_response()
}

fn receiver_stream(
    rx: SessionReceiver,
) -> impl futures_util::Stream<Item = std::io::Result<axum::body::Bytes>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_audio))
        .fallback(not_found)
        .with_state(state)
}

// ── Server startup ────────────────────────────────────────────────────────────

pub fn start_server(
    bind_address: String,
    port: u16,
    state: ProxyState,
) -> tokio::task::JoinHandle<()> {
    let app = router(state);

    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind media proxy on {}: {}", addr, e);
                return;
            }
        };
        info!("Media proxy listening on http://{}{}", addr, STREAM_PATH);
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Media proxy error: {}", e);
        }
    })
}
