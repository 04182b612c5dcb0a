//! Per-archetype background worker: owns one household WebSocket connection
//! so UI stalls can never block packet cadence (§4.9).
//!
//! Each worker runs as its own `tokio::spawn`ed task, communicating
//! throughput samples back to the orchestrator over an `mpsc` channel
//! rather than through a shared mutable object (§4.9.1).

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use netprobe_core::{
    archetype::UserArchetype,
    prng::PayloadPool,
    protocol::{ControlFrame, FrameHeader, WireDirection, WireKind, HEADER_LEN},
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::{errors::ClientError, measurement::ThroughputEvent};

/// How often a worker reports its rolling throughput to the orchestrator.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// One archetype's persistent household connection.
///
/// Holds no socket itself once spawned — [`ArchetypeWorker::spawn`] moves
/// the connection into its own task and returns only a handle, matching the
/// "background worker that owns its socket" requirement so the orchestrator
/// never blocks a UI thread on network I/O.
pub struct ArchetypeWorker;

impl ArchetypeWorker {
    /// Connect to `ws_url` and run until the connection closes or errors,
    /// emitting [`ThroughputEvent`]s on `events_tx` as traffic arrives.
    ///
    /// Intended to be wrapped in `tokio::spawn`; returns only once the
    /// connection is gone, at which point it has already sent a
    /// [`ThroughputEvent::HouseholdDisconnected`].
    pub async fn run(
        archetype: UserArchetype,
        ws_url: String,
        pool: Arc<PayloadPool>,
        events_tx: mpsc::UnboundedSender<ThroughputEvent>,
    ) {
        let reason = match Self::run_inner(archetype, &ws_url, &pool, &events_tx).await {
            Ok(()) => "closed".to_string(),
            Err(err) => {
                warn!(?archetype, %err, "household connection ended");
                err.to_string()
            }
        };
        let _ = events_tx.send(ThroughputEvent::HouseholdDisconnected { archetype, reason });
    }

    async fn run_inner(
        archetype: UserArchetype,
        ws_url: &str,
        pool: &Arc<PayloadPool>,
        events_tx: &mpsc::UnboundedSender<ThroughputEvent>,
    ) -> Result<(), ClientError> {
        let (stream, _response) = tokio_tungstenite::connect_async(ws_url).await?;
        let (mut write, mut read) = stream.split();

        let mut down_bytes_window = 0u64;
        let mut up_bytes_window = 0u64;
        let mut report_timer = tokio::time::interval(REPORT_INTERVAL);
        report_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = read.next() => {
                    let Some(message) = message else { return Ok(()) };
                    let message = message?;
                    match message {
                        Message::Binary(data) => {
                            if let Some(header) = FrameHeader::decode(&data) {
                                if header.direction == WireDirection::Down {
                                    down_bytes_window += data.len().saturating_sub(HEADER_LEN) as u64;
                                }
                            }
                        }
                        Message::Text(text) => {
                            match serde_json::from_str::<ControlFrame>(&text) {
                                Ok(ControlFrame::RequestUpload { seq, bytes, deadline_ms: _ }) => {
                                    let sent = send_upload(&mut write, pool, seq, bytes).await?;
                                    up_bytes_window += sent;
                                }
                                Ok(ControlFrame::ConnectionTest { probe_id }) => {
                                    let reply = ControlFrame::ConnectionTestReply { probe_id };
                                    let json = serde_json::to_string(&reply)?;
                                    write.send(Message::Text(json.into())).await?;
                                }
                                Ok(ControlFrame::Stats { .. }) => {
                                    trace!(?archetype, "server stats frame received");
                                }
                                Ok(other) => {
                                    debug!(?archetype, ?other, "unexpected control frame from server");
                                }
                                Err(err) => {
                                    warn!(?archetype, %err, "malformed control frame from server");
                                }
                            }
                        }
                        Message::Close(_) => return Ok(()),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
                _ = report_timer.tick() => {
                    let _ = events_tx.send(ThroughputEvent::Household {
                        archetype,
                        down_bytes: down_bytes_window,
                        up_bytes: up_bytes_window,
                        window: REPORT_INTERVAL,
                    });
                    down_bytes_window = 0;
                    up_bytes_window = 0;
                }
            }
        }
    }
}

/// Satisfy one `request_upload` by sending `bytes` of pseudo-random payload
/// in a handful of chunks tagged with the requesting frame's `seq` in
/// `aux`, so the server can reconcile requested-vs-received accounting.
async fn send_upload(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    pool: &Arc<PayloadPool>,
    request_seq: u32,
    bytes: u64,
) -> Result<u64, ClientError> {
    const MAX_CHUNK: u64 = u16::MAX as u64;
    let mut remaining = bytes;
    let mut sent = 0u64;
    let mut seq = 0u32;
    while remaining > 0 {
        let size = remaining.min(MAX_CHUNK) as usize;
        let header = FrameHeader {
            seq,
            send_ts: netprobe_core::util::now_unix_ms() as u32,
            direction: WireDirection::Up,
            kind: WireKind::Traffic,
            size: size as u16,
            aux: request_seq,
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + size);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&pool.take(size));
        write.send(Message::Binary(buf.into())).await?;
        sent += size as u64;
        remaining -= size as u64;
        seq = seq.wrapping_add(1);
    }
    Ok(sent)
}
