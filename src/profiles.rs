//! Traffic profiles: the immutable, per-archetype bandwidth and shaping
//! contracts each synthetic user archetype is held to.

use serde::{Deserialize, Serialize};

use crate::archetype::UserArchetype;

/// Coarse traffic shape, used for logging/metrics grouping only; the actual
/// rate schedule lives in [`BurstPattern`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ActivityType {
    /// Small, frequent, latency-sensitive packets (gamer).
    RealtimeSmall,
    /// Symmetric, latency-sensitive media (video caller).
    VideoBidirectional,
    /// High-peak bursts separated by near-idle pauses (streamer).
    BurstyStream,
    /// Sustained large transfer (bulk/"computer").
    BulkTransfer,
}

/// Time-varying rate schedule for a profile.
///
/// A tagged variant rather than a trait-object hierarchy — this is what keeps
/// [`crate::burst::evaluate`] a pure function instead of dynamic dispatch
/// over a class hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BurstPattern {
    /// Rate never changes.
    Constant,
    /// Two-phase cycle named after the Netflix adaptive-bitrate shape: a
    /// short high-rate burst followed by a longer near-silent pause.
    NetflixAdaptive {
        /// Duration of the high-rate phase, in seconds.
        burst_s: f64,
        /// Duration of the low-rate phase, in seconds.
        pause_s: f64,
        /// Download rate during the burst phase, in Mbps.
        burst_rate: f64,
        /// Download rate during the pause phase, in Mbps.
        pause_rate: f64,
    },
    /// Two-phase cycle modeling a bulk downloader's active/idle behavior.
    ComputerBursty {
        /// Duration of the active phase, in seconds.
        active_s: f64,
        /// Duration of the background phase, in seconds.
        background_s: f64,
        /// Download rate during the active phase, in Mbps.
        active_rate: f64,
        /// Download rate during the background phase, in Mbps.
        background_rate: f64,
    },
}

/// Shapes real-time archetypes (gamer, video_caller) to avoid misclassification
/// as bulk traffic by fair-queue shapers such as CAKE.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[non_exhaustive]
pub struct PacketEnvelope {
    /// Minimum payload size, in bytes, inclusive.
    pub min_bytes: u16,
    /// Maximum payload size, in bytes, inclusive.
    pub max_bytes: u16,
    /// Nominal interval between sends, in milliseconds.
    pub send_interval_ms: u32,
    /// Fraction of traffic (by rate) that flows upload vs. download.
    pub upload_fraction: f64,
}

/// An immutable traffic profile bound to one archetype.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[non_exhaustive]
pub struct TrafficProfile {
    /// Human-readable name, e.g. "Online Gamer".
    pub name: String,
    /// One-line description for dashboards.
    pub description: String,
    /// Nominal or peak download rate, in Mbps.
    pub download_mbps: f64,
    /// Nominal upload rate, in Mbps.
    pub upload_mbps: f64,
    /// Coarse traffic shape classification.
    pub activity_type: ActivityType,
    /// Time-varying rate schedule.
    pub burst_pattern: BurstPattern,
    /// Real-time packet shaping envelope, if this archetype needs one.
    pub packet_envelope: Option<PacketEnvelope>,
}

/// Which bursty pattern the bulk archetype uses by default.
///
/// The bulk/"computer" user can run either a constant-rate profile or a
/// `computer_bursty` active/background profile; this crate makes it
/// configurable and defaults to `Constant`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkBurstMode {
    /// Bulk download runs at a constant rate (default).
    #[default]
    Constant,
    /// Bulk download alternates active/background phases.
    ComputerBursty,
}

/// Tunables for constructing the bulk archetype's profile, since its
/// `download_mbps` is not canonical but derived from warmup measurement.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct BulkProfileConfig {
    /// Which burst pattern the bulk archetype uses.
    #[serde(default)]
    pub burst_mode: BulkBurstMode,
    /// Upload rate, in Mbps. Canonically 0.1.
    #[serde(default = "BulkProfileConfig::default_upload_mbps")]
    pub upload_mbps: f64,
}

impl Default for BulkProfileConfig {
    fn default() -> Self {
        Self {
            burst_mode: BulkBurstMode::default(),
            upload_mbps: Self::default_upload_mbps(),
        }
    }
}

impl BulkProfileConfig {
    fn default_upload_mbps() -> f64 {
        0.1
    }
}

impl TrafficProfile {
    /// Canonical gamer profile.
    #[must_use]
    pub fn gamer() -> Self {
        Self {
            name: "Online Gamer".into(),
            description: "Small, frequent, latency-sensitive packets".into(),
            download_mbps: 0.215,
            upload_mbps: 0.092,
            activity_type: ActivityType::RealtimeSmall,
            burst_pattern: BurstPattern::Constant,
            packet_envelope: Some(PacketEnvelope {
                min_bytes: 64,
                max_bytes: 128,
                send_interval_ms: 25,
                upload_fraction: 0.30,
            }),
        }
    }

    /// Canonical video-caller profile.
    #[must_use]
    pub fn video_caller() -> Self {
        Self {
            name: "Video Caller".into(),
            description: "Symmetric, latency-sensitive video conferencing traffic".into(),
            download_mbps: 1.8,
            upload_mbps: 1.8,
            activity_type: ActivityType::VideoBidirectional,
            burst_pattern: BurstPattern::Constant,
            packet_envelope: Some(PacketEnvelope {
                min_bytes: 800,
                max_bytes: 1000,
                send_interval_ms: 20,
                upload_fraction: 0.50,
            }),
        }
    }

    /// Canonical streamer profile.
    #[must_use]
    pub fn streamer() -> Self {
        Self {
            name: "Video Streamer".into(),
            description: "Adaptive-bitrate bursty streaming traffic".into(),
            download_mbps: 25.0,
            upload_mbps: 0.1,
            activity_type: ActivityType::BurstyStream,
            burst_pattern: BurstPattern::NetflixAdaptive {
                burst_s: 5.0,
                pause_s: 10.0,
                burst_rate: 25.0,
                pause_rate: 0.0,
            },
            packet_envelope: None,
        }
    }

    /// Bulk ("computer") profile, parameterized by warmup (`download_mbps`)
    /// and the open-question resolution in [`BulkProfileConfig`].
    #[must_use]
    pub fn bulk(download_mbps: f64, cfg: &BulkProfileConfig) -> Self {
        let burst_pattern = match cfg.burst_mode {
            BulkBurstMode::Constant => BurstPattern::Constant,
            BulkBurstMode::ComputerBursty => BurstPattern::ComputerBursty {
                active_s: 8.0,
                background_s: 20.0,
                active_rate: 30.0,
                background_rate: 2.0,
            },
        };
        Self {
            name: "Bulk Downloader".into(),
            description: "Sustained large file transfer, the 'computer' user".into(),
            download_mbps,
            upload_mbps: cfg.upload_mbps,
            activity_type: ActivityType::BulkTransfer,
            burst_pattern,
            packet_envelope: None,
        }
    }

    /// Canonical profile for an archetype, given the bulk user's measured
    /// download capacity and bulk burst-mode configuration.
    ///
    /// For non-bulk archetypes, `bulk_download_mbps` and `bulk_cfg` are
    /// ignored.
    #[must_use]
    pub fn canonical(archetype: UserArchetype, bulk_download_mbps: f64, bulk_cfg: &BulkProfileConfig) -> Self {
        match archetype {
            UserArchetype::Gamer => Self::gamer(),
            UserArchetype::VideoCaller => Self::video_caller(),
            UserArchetype::Streamer => Self::streamer(),
            UserArchetype::Bulk => Self::bulk(bulk_download_mbps, bulk_cfg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamer_matches_canonical_values() {
        let p = TrafficProfile::gamer();
        assert_eq!(p.download_mbps, 0.215);
        assert_eq!(p.upload_mbps, 0.092);
        let env = p.packet_envelope.unwrap();
        assert_eq!((env.min_bytes, env.max_bytes), (64, 128));
        assert_eq!(env.send_interval_ms, 25);
    }

    #[test]
    fn streamer_duty_cycle_matches_canonical_values() {
        let p = TrafficProfile::streamer();
        match p.burst_pattern {
            BurstPattern::NetflixAdaptive { burst_s, pause_s, burst_rate, pause_rate } => {
                assert_eq!((burst_s, pause_s), (5.0, 10.0));
                assert_eq!((burst_rate, pause_rate), (25.0, 0.0));
            }
            _ => panic!("expected netflix_adaptive"),
        }
    }

    #[test]
    fn bulk_defaults_to_constant() {
        let cfg = BulkProfileConfig::default();
        assert_eq!(cfg.burst_mode, BulkBurstMode::Constant);
        let p = TrafficProfile::bulk(100.0, &cfg);
        assert_eq!(p.burst_pattern, BurstPattern::Constant);
        assert_eq!(p.download_mbps, 100.0);
    }
}
