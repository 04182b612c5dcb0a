//! The four virtual-household user archetypes and their fixed port bindings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four synthetic household users the virtual-household scenario
/// drives simultaneously.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum UserArchetype {
    /// Low-bitrate, latency-sensitive, constant-rate traffic.
    Gamer,
    /// Symmetric, latency-sensitive, constant-rate traffic.
    VideoCaller,
    /// High-peak, bursty adaptive-streaming traffic.
    Streamer,
    /// Large constant or bursty bulk download, the "computer" user.
    Bulk,
}

impl UserArchetype {
    /// All archetypes, in the fixed order the supervisor spawns them.
    pub const ALL: [UserArchetype; 4] = [
        UserArchetype::Gamer,
        UserArchetype::VideoCaller,
        UserArchetype::Streamer,
        UserArchetype::Bulk,
    ];

    /// Short tag used in URLs, CLI args, and log fields.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Gamer => "gamer",
            Self::VideoCaller => "video_caller",
            Self::Streamer => "streamer",
            Self::Bulk => "bulk",
        }
    }

    /// Parse a tag as used in `/ws/virtual-household/{archetype_tag}`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "gamer" => Some(Self::Gamer),
            "video_caller" => Some(Self::VideoCaller),
            "streamer" => Some(Self::Streamer),
            "bulk" => Some(Self::Bulk),
            _ => None,
        }
    }

    /// Default externally visible port for this archetype's dedicated process.
    ///
    /// Ports are drawn from a contiguous range starting at 8001, in the fixed
    /// order gamer, video_caller, streamer, bulk.
    #[must_use]
    pub fn default_port(&self, base: u16) -> u16 {
        base + match self {
            Self::Gamer => 0,
            Self::VideoCaller => 1,
            Self::Streamer => 2,
            Self::Bulk => 3,
        }
    }
}

impl fmt::Display for UserArchetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for a in UserArchetype::ALL {
            assert_eq!(UserArchetype::from_tag(a.tag()), Some(a));
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(UserArchetype::from_tag("vpn"), None);
    }

    #[test]
    fn default_ports_are_contiguous() {
        let base = 8001;
        let ports: Vec<u16> = UserArchetype::ALL.iter().map(|a| a.default_port(base)).collect();
        assert_eq!(ports, vec![8001, 8002, 8003, 8004]);
    }
}
