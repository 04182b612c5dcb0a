//! Error types for the client orchestrator (component C8).

use thiserror::Error;

/// Failure modes the orchestrator surfaces to its caller.
///
/// Every variant here is scoped to one connection or one HTTP request —
/// same recovery posture as the server side (§7): a single archetype
/// dropping out does not abort the other three, and a single sweep phase
/// failing does not crash the process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The supervisor's redirect endpoint could not be reached or returned
    /// something other than a [`netprobe_core::protocol::RedirectDescriptor`].
    #[error("redirect lookup failed for {archetype}: {source}")]
    Redirect {
        /// Archetype tag the redirect was requested for.
        archetype: String,
        /// Underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },
    /// An HTTP request (download/upload/ping) failed outright.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The WebSocket handshake or an I/O operation on it failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// A control frame could not be decoded as JSON.
    #[error("malformed control frame: {0}")]
    MalformedControlFrame(#[from] serde_json::Error),
    /// The server URL was not a valid `ws(s)://` or `http(s)://` endpoint.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}
