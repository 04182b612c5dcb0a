//! Single-user HTTP endpoints (component C6) plus the supervisor's own
//! aggregate/redirect surface — all served directly by the supervisor
//! process, never proxied through a child.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::{Body, Bytes as AxumBytes},
    extract::{ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream, StreamExt};
use netprobe_core::{archetype::UserArchetype, protocol::RedirectDescriptor, util::now_unix_ms};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;

/// Default safety ceiling for `/download` and `/warmup/bulk-download`: high
/// enough to never be the bottleneck on any real access link, low enough to
/// keep one greedy client from pinning a CPU core forever.
const DEFAULT_CEILING_BYTES_PER_SEC: u64 = 2000 * 1024 * 1024;
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;
const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const UPLOAD_CHUNK_WINDOW: usize = 8 * 1024 * 1024;

#[derive(Deserialize)]
pub struct DownloadParams {
    #[serde(default)]
    bytes: Option<u64>,
}

/// `GET /download`: stream shaped filler bytes until the client disconnects
/// or the rolling-hour byte budget trips, whichever comes first.
pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<DownloadParams>,
) -> Response {
    stream_download(state, addr, params.bytes, DEFAULT_CEILING_BYTES_PER_SEC)
}

/// `GET /warmup/bulk-download`: identical wire behavior to `/download`, kept
/// as a distinct path so the client's adaptive-warmup measurement never
/// shares rate-limit accounting semantics with a user-facing download test
/// in logs/dashboards.
pub async fn warmup_download_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<DownloadParams>,
) -> Response {
    stream_download(state, addr, params.bytes, DEFAULT_CEILING_BYTES_PER_SEC)
}

fn stream_download(
    state: Arc<AppState>,
    addr: SocketAddr,
    cap_bytes: Option<u64>,
    ceiling_bytes_per_sec: u64,
) -> Response {
    let client_ip = addr.ip();
    if state.rate_limiter.check_flood_prefilter(client_ip).is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "too many requests").into_response();
    }
    if state.rate_limiter.check_and_record_download(client_ip, 0).is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "download budget exceeded").into_response();
    }

    let pool = state.pool.clone();
    let rate_limiter = state.rate_limiter.clone();
    let start = Instant::now();
    let body_stream = stream::unfold((0u64,), move |(sent,)| {
        let pool = pool.clone();
        let rate_limiter = rate_limiter.clone();
        async move {
            if let Some(cap) = cap_bytes {
                if sent >= cap {
                    return None;
                }
            }
            let chunk_len = cap_bytes
                .map(|cap| (cap - sent).min(DOWNLOAD_CHUNK_BYTES as u64) as usize)
                .unwrap_or(DOWNLOAD_CHUNK_BYTES);
            if rate_limiter.check_additional_bytes(client_ip, chunk_len as u64).is_err() {
                return None;
            }
            let chunk = pool.take(chunk_len);
            let new_sent = sent + chunk.len() as u64;

            let elapsed = start.elapsed();
            let scheduled = Duration::from_secs_f64(new_sent as f64 / ceiling_bytes_per_sec as f64);
            if scheduled > elapsed {
                tokio::time::sleep(scheduled - elapsed).await;
            }
            Some((Ok::<_, std::io::Error>(chunk), (new_sent,)))
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(body_stream))
        .expect("static response parts are always valid")
}

/// `POST /upload`: drain the request body in bounded windows, never
/// buffering the whole request; reject anything over
/// [`MAX_UPLOAD_BYTES`].
pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Body,
) -> Response {
    if state.rate_limiter.check_flood_prefilter(addr.ip()).is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "too many requests").into_response();
    }
    let mut stream = body.into_data_stream();
    let mut total: u64 = 0;
    let mut window: usize = 0;
    while let Some(next) = stream.next().await {
        let chunk: AxumBytes = match next {
            Ok(c) => c,
            Err(err) => {
                warn!(%err, "upload body stream error");
                return (StatusCode::BAD_REQUEST, "malformed upload body").into_response();
            }
        };
        total += chunk.len() as u64;
        window += chunk.len();
        if total > MAX_UPLOAD_BYTES {
            return (StatusCode::PAYLOAD_TOO_LARGE, "upload exceeds per-request limit").into_response();
        }
        if window >= UPLOAD_CHUNK_WINDOW {
            window = 0;
        }
    }
    Json(serde_json::json!({ "bytes_received": total })).into_response()
}

#[derive(Deserialize)]
pub struct PingParams {
    ts: Option<u64>,
}

/// `GET /ping`: timestamp echo, served from its own router with no shared
/// lock so it is never serialized behind a `/download` or `/upload` in
/// flight on the same connection pool.
pub async fn ping_handler(Query(params): Query<PingParams>) -> impl IntoResponse {
    Json(serde_json::json!({
        "echo_ts": params.ts,
        "server_time_ms": now_unix_ms(),
    }))
}

/// `GET /ws/virtual-household/{archetype_tag}`: tells the client which
/// dedicated child process to connect to directly, rather than proxying
/// WebSocket traffic through the supervisor.
pub async fn redirect_handler(
    Path(archetype_tag): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(archetype) = UserArchetype::from_tag(&archetype_tag) else {
        return (StatusCode::NOT_FOUND, "unknown archetype tag").into_response();
    };
    let scheme = if state.tls_enabled { "wss" } else { "ws" };
    Json(RedirectDescriptor {
        archetype: archetype.tag().to_string(),
        port: archetype.default_port(state.base_port),
        scheme: scheme.to_string(),
    })
    .into_response()
}

/// `GET /virtual-household/health`: aggregate child health report.
pub async fn household_health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(crate::children::health_report(&state.children))
}

/// `GET /virtual-household/stats`: live per-archetype `/stats` proxy,
/// fetched fresh rather than cached since stats are pulled on demand
/// (unlike health, which the poll loop already tracks continuously).
pub async fn household_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut per_archetype = serde_json::Map::new();
    for child in state.children.iter() {
        let value = crate::children::fetch_json(&state.http, child.port, "/stats")
            .await
            .unwrap_or_else(|err| serde_json::json!({ "error": err }));
        per_archetype.insert(child.archetype.tag().to_string(), value);
    }
    Json(serde_json::Value::Object(per_archetype))
}
