//! HTTP/WS surface exposed by a user process: `/health`, `/stats`, and the
//! per-archetype WebSocket upgrade.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use netprobe_core::{
    archetype::UserArchetype,
    protocol::{ControlFrame, FrameHeader, WireDirection, HEADER_LEN},
    profiles::TrafficProfile,
    session::{TerminationReason, TrafficSession},
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    sink::{AxumSink, SinkMessage},
    AppState,
};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    archetype: &'static str,
    uptime_s: u64,
    active_sessions: usize,
    watchdog_alive: bool,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let watchdog_alive = state.watchdog.is_alive();
    let status = if watchdog_alive { "ok" } else { "degraded" };
    Json(HealthResponse {
        status,
        archetype: state.archetype.tag(),
        uptime_s: state.manager.uptime().as_secs(),
        active_sessions: state.manager.session_count(),
        watchdog_alive,
    })
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.stats_snapshot())
}

/// Validate the requested archetype tag, apply rate limiting, and (if both
/// pass) hand the connection off to [`handle_socket`].
///
/// An archetype mismatch is rejected with `400` before any upgrade is
/// attempted, per the process's single-archetype contract.
pub async fn ws_upgrade_handler(
    Path(archetype_tag): Path<String>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(requested) = UserArchetype::from_tag(&archetype_tag) else {
        return (StatusCode::BAD_REQUEST, "unknown archetype tag").into_response();
    };
    if requested != state.archetype {
        return (StatusCode::BAD_REQUEST, "this process does not serve that archetype").into_response();
    }
    if state.rate_limiter.check_flood_prefilter(addr.ip()).is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "too many connection attempts").into_response();
    }

    let profile = match state.archetype {
        UserArchetype::Bulk => {
            let download_mbps = params
                .get("download_mbps")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v > 0.0)
                .unwrap_or(state.fallback_download_mbps);
            TrafficProfile::bulk(download_mbps, &state.bulk_profile)
        }
        other => TrafficProfile::canonical(other, 0.0, &state.bulk_profile),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr.ip(), profile))
}

/// Drive one accepted WS connection: reserve a rate-limit slot, register a
/// [`TrafficSession`], spawn the dedicated write task, and run the read
/// loop until the connection closes or sends something unintelligible.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client_ip: std::net::IpAddr,
    profile: TrafficProfile,
) {
    let archetype = state.archetype;
    if state.rate_limiter.check_and_reserve_session(client_ip, archetype).is_err() {
        debug!(%client_ip, ?archetype, "rejected session: rate limit");
        return;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_task(ws_tx, rx));

    let session_id = Uuid::new_v4();
    let sink = Arc::new(AxumSink::new(tx));
    let session = TrafficSession::new(session_id, archetype, client_ip, profile, sink, Instant::now());
    if state.manager.register(session).is_err() {
        debug!(%client_ip, ?archetype, "rejected session: process at capacity");
        state.rate_limiter.release_session(client_ip, archetype);
        return;
    }

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        match message {
            Message::Binary(data) => match FrameHeader::decode(&data) {
                Some(header) if header.direction == WireDirection::Up => {
                    let payload_len = data.len().saturating_sub(HEADER_LEN) as u64;
                    state.manager.record_upload_received(session_id, payload_len, Instant::now());
                }
                _ => {
                    warn!(session_id = %session_id, "malformed upload frame, closing session");
                    state.manager.terminate(session_id, TerminationReason::ProtocolViolation);
                    break;
                }
            },
            Message::Text(text) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(ControlFrame::ConnectionTestReply { probe_id }) => {
                    state.manager.reconcile_probe_reply(session_id, probe_id, Instant::now());
                }
                Ok(ControlFrame::Stats { .. }) => {
                    trace!(session_id = %session_id, "client stats frame received");
                    state.manager.touch(session_id, Instant::now());
                }
                Ok(_) => {
                    state.manager.touch(session_id, Instant::now());
                }
                Err(_) => {
                    warn!(session_id = %session_id, "malformed control frame, closing session");
                    state.manager.terminate(session_id, TerminationReason::ProtocolViolation);
                    break;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.manager.mark_closed(session_id);
    state.rate_limiter.release_session(client_ip, archetype);
}

/// Drains the sink channel and performs the actual async socket writes, so
/// [`crate::sink::AxumSink`]'s methods never need to await.
async fn write_task(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<SinkMessage>,
) {
    while let Some(item) = rx.recv().await {
        let outcome = match item {
            SinkMessage::Binary(bytes) => ws_tx.send(Message::Binary(bytes)).await,
            SinkMessage::Control(frame) => match serde_json::to_string(&frame) {
                Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                Err(err) => {
                    warn!(%err, "failed to encode control frame, dropping");
                    continue;
                }
            },
        };
        if outcome.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}
