use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use futures_util::{Stream, StreamExt};
use relay_proto::protocol::{ApiResponse, PlayRequest, RemoveRequest, StatusSnapshot, VolumeRequest};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::control::Controller;
use crate::notifier;

#[derive(Clone)]
pub struct HttpState {
    pub controller: Arc<Controller>,
    pub status_poll: Duration,
    pub default_volume: u8,
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok(body: ApiResponse) -> ApiResult {
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, msg: impl Into<String>) -> ApiResult {
    (status, Json(ApiResponse::error(msg)))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/play", post(play))
        .route("/stop", post(stop))
        .route("/volume", post(set_volume))
        .route("/remove_from_queue", post(remove_from_queue))
        .route("/status_stream", get(status_stream))
        .route("/api/state", get(get_state))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

// A missing or malformed body is treated like a body without the field.

async fn play(State(state): State<HttpState>, body: Option<Json<PlayRequest>>) -> ApiResult {
    let url = body.and_then(|Json(b)| b.url).unwrap_or_default();
    info!("HTTP API: play '{}'", url);
    match state.controller.enqueue(&url).await {
        Ok(added) => ok(ApiResponse::added(added)),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn stop(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: stop");
    state.controller.stop().await;
    ok(ApiResponse::ok())
}

async fn set_volume(State(state): State<HttpState>, body: Option<Json<VolumeRequest>>) -> ApiResult {
    let level = body
        .and_then(|Json(b)| b.volume)
        .map(|v| v.clamp(0, 100) as u8)
        .unwrap_or(state.default_volume);
    info!("HTTP API: volume {}", level);
    match state.controller.set_volume(level).await {
        Ok(()) => ok(ApiResponse::ok()),
        Err(e) => {
            warn!("HTTP API: volume change failed: {}", e);
            fail(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

async fn remove_from_queue(
    State(state): State<HttpState>,
    body: Option<Json<RemoveRequest>>,
) -> ApiResult {
    let Some(index) = body.and_then(|Json(b)| b.index) else {
        return fail(StatusCode::BAD_REQUEST, "No index provided");
    };
    match state.controller.remove_from_queue(index).await {
        Ok(_) => ok(ApiResponse::ok()),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_state(State(state): State<HttpState>) -> Json<StatusSnapshot> {
    Json(state.controller.status().await)
}

async fn status_stream(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = notifier::status_stream(state.controller.clone(), state.status_poll).filter_map(
        |snapshot| async move {
            match Event::default().json_data(&snapshot) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    warn!("HTTP API: cannot encode status: {}", e);
                    None
                }
            }
        },
    );
    Sse::new(events).keep_alive(KeepAlive::default())
}
