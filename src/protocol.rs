//! Wire protocol between client and user-process.
//!
//! Download/upload payload frames are framed binary: a fixed header followed
//! by pseudo-random (or client-supplied, for uploads) payload bytes. Everything
//! else — upload requests, connection tests, stats snapshots, the redirect
//! descriptor — is small JSON.

use serde::{Deserialize, Serialize};

/// Direction tag carried in [`FrameHeader`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WireDirection {
    /// Server-to-client payload (`download_chunk`).
    Down = 0,
    /// Client-to-server payload (`upload_chunk`).
    Up = 1,
}

impl WireDirection {
    /// Decode from the header's raw `direction` byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            _ => None,
        }
    }
}

/// Frame payload kind, carried in [`FrameHeader`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WireKind {
    /// Ordinary shaped traffic payload.
    Traffic = 0,
    /// Reserved for future keepalive-only frames (zero-length payload).
    Keepalive = 1,
}

impl WireKind {
    /// Decode from the header's raw `kind` byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Traffic),
            1 => Some(Self::Keepalive),
            _ => None,
        }
    }
}

/// Fixed 16-byte binary header prefixed to every `download_chunk` /
/// `upload_chunk` frame: `{ seq:u32, send_ts:u32, direction:u8, kind:u8,
/// size:u16, aux:u32 }`.
///
/// `send_ts` is milliseconds since process start, truncated to 32 bits — this
/// wraps after roughly 49 days, which is fine for a short-lived validation
/// session but is documented here rather than silently assumed.
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    /// Strictly monotonically increasing sequence number, per session.
    pub seq: u32,
    /// Send timestamp, ms since process start (wraps at u32::MAX).
    pub send_ts: u32,
    /// Payload direction.
    pub direction: WireDirection,
    /// Payload kind.
    pub kind: WireKind,
    /// Payload length in bytes, not including this header.
    pub size: u16,
    /// Auxiliary field: for download chunks, unused (0); for upload chunks,
    /// the `seq` of the `request_upload` frame they're satisfying.
    pub aux: u32,
}

/// Size of the encoded header, in bytes.
pub const HEADER_LEN: usize = 16;

impl FrameHeader {
    /// Encode into a 16-byte buffer, big-endian.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.send_ts.to_be_bytes());
        buf[8] = self.direction as u8;
        buf[9] = self.kind as u8;
        buf[10..12].copy_from_slice(&self.size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.aux.to_be_bytes());
        buf
    }

    /// Decode from a 16-byte buffer.
    ///
    /// Returns `None` if the buffer is short or the direction/kind bytes are
    /// unrecognized. Malformed frames close the session; they never crash
    /// the process.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let seq = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        let send_ts = u32::from_be_bytes(buf[4..8].try_into().ok()?);
        let direction = WireDirection::from_u8(buf[8])?;
        let kind = WireKind::from_u8(buf[9])?;
        let size = u16::from_be_bytes(buf[10..12].try_into().ok()?);
        let aux = u32::from_be_bytes(buf[12..16].try_into().ok()?);
        Some(Self { seq, send_ts, direction, kind, size, aux })
    }
}

/// Small JSON control messages exchanged in either direction over the same
/// WebSocket as the binary frames.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ControlFrame {
    /// Server asks the client to upload `bytes` within `deadline_ms`.
    RequestUpload {
        /// Sequence number correlating this request with the resulting
        /// `upload_chunk` frames' `aux` field.
        seq: u32,
        /// Requested total byte count for this tick's upload.
        bytes: u64,
        /// Soft deadline, in milliseconds from now, by which bytes should
        /// arrive. Missed deadlines are tracked as shortfall, not an error —
        /// a repeated shortfall does not terminate the session.
        deadline_ms: u32,
    },
    /// Server asks the client to answer a liveness probe.
    ConnectionTest {
        /// Opaque id, echoed back in [`ControlFrame::ConnectionTestReply`].
        probe_id: u64,
    },
    /// Client's answer to a [`ControlFrame::ConnectionTest`].
    ConnectionTestReply {
        /// Echoed probe id.
        probe_id: u64,
    },
    /// Periodic metrics snapshot, either direction.
    Stats {
        /// Arbitrary metric key/value pairs, kept loose since both ends emit
        /// slightly different fields (measured throughput vs. requested-vs-
        /// received accounting).
        #[serde(flatten)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

/// Redirect descriptor returned by `GET /ws/virtual-household/{archetype_tag}`
/// on the supervisor, naming the dedicated process the client should connect
/// to directly.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RedirectDescriptor {
    /// Archetype tag, e.g. `"gamer"`.
    pub archetype: String,
    /// Externally visible port of the archetype's dedicated process.
    pub port: u16,
    /// URI scheme the client should use (`"wss"` once TLS is configured,
    /// `"ws"` otherwise).
    pub scheme: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let h = FrameHeader {
            seq: 42,
            send_ts: 123_456,
            direction: WireDirection::Down,
            kind: WireKind::Traffic,
            size: 96,
            aux: 0,
        };
        let encoded = h.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.send_ts, 123_456);
        assert_eq!(decoded.direction, WireDirection::Down);
        assert_eq!(decoded.kind, WireKind::Traffic);
        assert_eq!(decoded.size, 96);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(FrameHeader::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn decode_rejects_unknown_direction() {
        let mut buf = [0u8; HEADER_LEN];
        buf[8] = 0xFF;
        assert!(FrameHeader::decode(&buf).is_none());
    }

    #[test]
    fn control_frame_json_shape() {
        let f = ControlFrame::ConnectionTest { probe_id: 7 };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"type\":\"connection_test\""));
        assert!(json.contains("\"probe_id\":7"));
    }
}
