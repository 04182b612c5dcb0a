//! Bridges the scheduler's synchronous [`SessionSink`] contract onto an
//! axum WebSocket, whose writes are only ever async.

use bytes::Bytes;
use netprobe_core::{
    protocol::ControlFrame,
    session::{SessionSink, SessionSinkError},
};
use tokio::sync::mpsc;

/// One item queued for the connection's dedicated write task.
pub enum SinkMessage {
    Binary(Bytes),
    Control(ControlFrame),
}

/// [`SessionSink`] implementation backed by an unbounded channel to a
/// per-connection write task.
///
/// `send_binary`/`send_control` only enqueue; they never touch the socket
/// themselves, which is what keeps them synchronous and non-blocking as the
/// trait requires. Backpressure is bounded instead by the scheduler's own
/// per-tick budget, not by this channel.
pub struct AxumSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl AxumSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<SinkMessage>) -> Self {
        Self { tx }
    }
}

impl SessionSink for AxumSink {
    fn send_binary(&self, frame: Bytes) -> Result<(), SessionSinkError> {
        self.tx.send(SinkMessage::Binary(frame)).map_err(|_| SessionSinkError::Closed)
    }

    fn send_control(&self, frame: &ControlFrame) -> Result<(), SessionSinkError> {
        self.tx
            .send(SinkMessage::Control(frame.clone()))
            .map_err(|_| SessionSinkError::Closed)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
