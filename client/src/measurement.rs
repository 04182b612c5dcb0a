//! `CurrentMeasurement`: the shared aggregation surface the orchestrator
//! updates from per-archetype worker events and the single-user sweep
//! reports progress into.
//!
//! Kept as plain data plus an `mpsc`-fed aggregation loop rather than a
//! shared mutable UI object (§4.9.1): workers never touch this struct
//! directly, they only ever send [`ThroughputEvent`]s.

use std::{collections::HashMap, time::Duration};

use netprobe_core::archetype::UserArchetype;
use serde::Serialize;

/// One throughput/latency update emitted by an archetype worker
/// ([`crate::transport::ArchetypeWorker`]) or the single-user sweep.
#[derive(Clone, Debug)]
pub enum ThroughputEvent {
    /// A household archetype connection reports its rolling throughput.
    Household {
        /// Which archetype this sample belongs to.
        archetype: UserArchetype,
        /// Bytes received (download) since the previous sample.
        down_bytes: u64,
        /// Bytes sent (upload) since the previous sample.
        up_bytes: u64,
        /// Wall-clock span this sample covers.
        window: Duration,
    },
    /// A household connection dropped out of the household (closed, errored,
    /// or was terminated by the server).
    HouseholdDisconnected {
        /// Which archetype disconnected.
        archetype: UserArchetype,
        /// Human-readable reason, for logging/telemetry only.
        reason: String,
    },
    /// A ping round-trip sample, tagged with which sweep phase it was taken
    /// during so bufferbloat grading can compare against the baseline.
    Ping {
        /// Which phase of the single-user sweep this was sampled during.
        phase: SweepPhase,
        /// Observed round-trip time.
        rtt: Duration,
    },
    /// A single-user sweep phase finished with a measured throughput.
    SweepPhaseComplete {
        /// Which phase completed.
        phase: SweepPhase,
        /// Measured throughput, in Mbps.
        mbps: f64,
    },
}

/// Phases of the single-user speed/bufferbloat sweep (§4.6), in the order
/// the orchestrator runs them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    /// Idle baseline latency, before any saturating traffic starts.
    Baseline,
    /// Download saturation, ping running concurrently.
    Download,
    /// Upload saturation (after tiering classification), ping running
    /// concurrently.
    Upload,
    /// Simultaneous download + upload saturation, ping running concurrently.
    Bidirectional,
}

/// Per-archetype rolling throughput, as last reported by its worker.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ArchetypeThroughput {
    /// Most recently observed download rate, in Mbps.
    pub down_mbps: f64,
    /// Most recently observed upload rate, in Mbps.
    pub up_mbps: f64,
    /// Whether this archetype's connection is still alive.
    pub connected: bool,
}

/// Aggregate ping statistics for one sweep phase.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PingStats {
    /// Sample count.
    pub count: u32,
    /// Mean RTT, in milliseconds.
    pub mean_ms: f64,
    /// Minimum observed RTT, in milliseconds.
    pub min_ms: f64,
    /// Maximum observed RTT, in milliseconds.
    pub max_ms: f64,
}

impl PingStats {
    fn record(&mut self, rtt: Duration) {
        let ms = rtt.as_secs_f64() * 1000.0;
        let new_count = self.count + 1;
        self.mean_ms = (self.mean_ms * f64::from(self.count) + ms) / f64::from(new_count);
        self.min_ms = if self.count == 0 { ms } else { self.min_ms.min(ms) };
        self.max_ms = self.max_ms.max(ms);
        self.count = new_count;
    }
}

/// Shared aggregation object the orchestrator updates as events arrive and
/// a caller (CLI printer, UI, telemetry submission) reads from.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CurrentMeasurement {
    /// Per-archetype household throughput, keyed by archetype tag.
    pub household: HashMap<UserArchetype, ArchetypeThroughput>,
    /// Ping statistics, keyed by sweep phase.
    pub ping: HashMap<SweepPhase, PingStats>,
    /// Measured throughput per completed sweep phase, in Mbps.
    pub sweep_mbps: HashMap<SweepPhase, f64>,
}

impl CurrentMeasurement {
    /// Build an empty measurement with every archetype present but
    /// disconnected, so a consumer never has to handle a missing key.
    #[must_use]
    pub fn new() -> Self {
        let mut household = HashMap::new();
        for archetype in UserArchetype::ALL {
            household.insert(archetype, ArchetypeThroughput::default());
        }
        Self { household, ping: HashMap::new(), sweep_mbps: HashMap::new() }
    }

    /// Fold one [`ThroughputEvent`] into this measurement.
    pub fn apply(&mut self, event: &ThroughputEvent) {
        match event {
            ThroughputEvent::Household { archetype, down_bytes, up_bytes, window } => {
                let entry = self.household.entry(*archetype).or_default();
                entry.connected = true;
                if !window.is_zero() {
                    entry.down_mbps = bytes_to_mbps(*down_bytes, *window);
                    entry.up_mbps = bytes_to_mbps(*up_bytes, *window);
                }
            }
            ThroughputEvent::HouseholdDisconnected { archetype, .. } => {
                let entry = self.household.entry(*archetype).or_default();
                entry.connected = false;
                entry.down_mbps = 0.0;
                entry.up_mbps = 0.0;
            }
            ThroughputEvent::Ping { phase, rtt } => {
                self.ping.entry(*phase).or_default().record(*rtt);
            }
            ThroughputEvent::SweepPhaseComplete { phase, mbps } => {
                self.sweep_mbps.insert(*phase, *mbps);
            }
        }
    }

    /// Total household throughput across every archetype, in Mbps.
    #[must_use]
    pub fn total_household_down_mbps(&self) -> f64 {
        self.household.values().map(|a| a.down_mbps).sum()
    }

    /// Additional latency a phase observed over the baseline, in
    /// milliseconds — the bufferbloat grade (§4.6: "grades are computed as
    /// additional latency over baseline").
    #[must_use]
    pub fn bufferbloat_ms(&self, phase: SweepPhase) -> Option<f64> {
        let baseline = self.ping.get(&SweepPhase::Baseline)?;
        let under_load = self.ping.get(&phase)?;
        Some((under_load.mean_ms - baseline.mean_ms).max(0.0))
    }
}

fn bytes_to_mbps(bytes: u64, window: Duration) -> f64 {
    (bytes as f64 * 8.0) / window.as_secs_f64() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_measurement_has_every_archetype_disconnected() {
        let m = CurrentMeasurement::new();
        assert_eq!(m.household.len(), 4);
        assert!(m.household.values().all(|a| !a.connected));
    }

    #[test]
    fn household_event_updates_throughput() {
        let mut m = CurrentMeasurement::new();
        m.apply(&ThroughputEvent::Household {
            archetype: UserArchetype::Gamer,
            down_bytes: 2_687_500, // ~0.215 Mbps over 100ms window's worth of bytes-ish
            up_bytes: 0,
            window: Duration::from_secs(1),
        });
        let entry = m.household[&UserArchetype::Gamer];
        assert!(entry.connected);
        assert!((entry.down_mbps - 21.5).abs() < 0.01);
    }

    #[test]
    fn disconnection_zeros_throughput() {
        let mut m = CurrentMeasurement::new();
        m.apply(&ThroughputEvent::Household {
            archetype: UserArchetype::Bulk,
            down_bytes: 1_000_000,
            up_bytes: 0,
            window: Duration::from_secs(1),
        });
        m.apply(&ThroughputEvent::HouseholdDisconnected {
            archetype: UserArchetype::Bulk,
            reason: "closed".into(),
        });
        let entry = m.household[&UserArchetype::Bulk];
        assert!(!entry.connected);
        assert_eq!(entry.down_mbps, 0.0);
    }

    #[test]
    fn bufferbloat_ms_is_difference_from_baseline() {
        let mut m = CurrentMeasurement::new();
        m.apply(&ThroughputEvent::Ping { phase: SweepPhase::Baseline, rtt: Duration::from_millis(10) });
        m.apply(&ThroughputEvent::Ping { phase: SweepPhase::Download, rtt: Duration::from_millis(150) });
        let grade = m.bufferbloat_ms(SweepPhase::Download).unwrap();
        assert!((grade - 140.0).abs() < 0.01);
    }

    #[test]
    fn ping_stats_track_mean_min_max() {
        let mut stats = PingStats::default();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        stats.record(Duration::from_millis(20));
        assert!((stats.mean_ms - 20.0).abs() < 0.01);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert_eq!(stats.count, 3);
    }
}
