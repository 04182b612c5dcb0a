//! Single-user speed/bufferbloat sweep (component C6's client-side
//! counterpart) and the upload speed-tiered chunk-size search (§4.7).

use std::time::{Duration, Instant};

use futures::StreamExt;
use netprobe_core::prng::PayloadPool;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    errors::ClientError,
    measurement::{SweepPhase, ThroughputEvent},
};

/// Tuning knobs for the single-user sweep.
///
/// `ping_interval` resolves one of spec.md's open questions (§9: "exact
/// ping sampling cadence during saturation is not uniformly documented")
/// as an explicit, documented tuning knob rather than a hardcoded constant.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[non_exhaustive]
pub struct SweepConfig {
    /// How often a ping sample is taken, including during saturation.
    /// Defaults to 200 ms, within the 100-250 ms range spec.md suggests.
    pub ping_interval: Duration,
    /// How long the idle baseline-latency phase runs.
    pub baseline_duration: Duration,
    /// How long each saturation phase (download/upload/bidirectional) runs,
    /// not counting the upload tiering probe.
    pub phase_duration: Duration,
    /// Duration of the upload-tiering ramp probe (§4.7: "a 3-second probe").
    pub tiering_probe_duration: Duration,
    /// How long each chunk-size step of the tiering probe is held before
    /// advancing to the next size.
    pub tiering_step_duration: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(200),
            baseline_duration: Duration::from_secs(3),
            phase_duration: Duration::from_secs(10),
            tiering_probe_duration: Duration::from_secs(3),
            tiering_step_duration: Duration::from_millis(300),
        }
    }
}

/// Upload-tiering chunk-size classification (§4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTier {
    /// Peak observed upload < 50 Mbps.
    Low,
    /// 50-150 Mbps.
    Medium,
    /// 150-500 Mbps.
    High,
    /// > 500 Mbps.
    VeryHigh,
}

impl UploadTier {
    /// Classify a peak observed Mbps into a tier, per the §4.7 table.
    #[must_use]
    pub fn classify(peak_mbps: f64) -> Self {
        if peak_mbps < 50.0 {
            Self::Low
        } else if peak_mbps < 150.0 {
            Self::Medium
        } else if peak_mbps <= 500.0 {
            Self::High
        } else {
            Self::VeryHigh
        }
    }

    /// Maximum chunk size for this tier, in bytes.
    #[must_use]
    pub fn max_chunk_bytes(&self) -> usize {
        match self {
            Self::Low => 512 * 1024,
            Self::Medium => 1024 * 1024,
            Self::High => 2 * 1024 * 1024,
            Self::VeryHigh => 6 * 1024 * 1024,
        }
    }
}

/// Chunk sizes the tiering probe ramps through, one per
/// [`SweepConfig::tiering_step_duration`] (§4.7: "ramps chunk size
/// 1 MB -> 2 MB -> 3 MB -> 4 MB -> 6 MB every 300 ms").
const TIERING_RAMP_BYTES: [usize; 5] = [
    1024 * 1024,
    2 * 1024 * 1024,
    3 * 1024 * 1024,
    4 * 1024 * 1024,
    6 * 1024 * 1024,
];

/// Number of concurrent upload/download connections the sweep uses.
const CONCURRENCY: usize = 3;

/// Fraction of measured download below which an upload result is
/// considered "asymmetric" and the sweep should stop early (§4.7).
const ASYMMETRIC_LINK_FRACTION: f64 = 0.20;

/// Driver for the single-user sweep: baseline ping, download saturation,
/// upload saturation (tiered), bidirectional saturation.
pub struct SingleUserSweep {
    http: reqwest::Client,
    base_url: String,
    config: SweepConfig,
}

impl SingleUserSweep {
    /// Build a sweep driver targeting `base_url` (the supervisor's own
    /// HTTP(S) endpoint, e.g. `"https://probe.example.com"`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, config: SweepConfig) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into(), config }
    }

    /// Run the full sweep, emitting [`ThroughputEvent`]s on `events_tx` as
    /// each phase progresses and completes.
    ///
    /// # Errors
    ///
    /// Returns an error only if the baseline ping phase itself can't reach
    /// the server at all; individual saturation phases degrade gracefully
    /// (a phase that can't saturate still reports whatever it measured).
    pub async fn run(&self, events_tx: mpsc::UnboundedSender<ThroughputEvent>) -> Result<(), ClientError> {
        self.run_ping_phase(SweepPhase::Baseline, self.config.baseline_duration, &events_tx).await?;

        let download_mbps = self.run_download_saturation(&events_tx).await?;
        let _ = events_tx.send(ThroughputEvent::SweepPhaseComplete { phase: SweepPhase::Download, mbps: download_mbps });

        let upload_mbps = self.run_upload_saturation(&events_tx).await?;
        let _ = events_tx.send(ThroughputEvent::SweepPhaseComplete { phase: SweepPhase::Upload, mbps: upload_mbps });

        if upload_mbps < download_mbps * ASYMMETRIC_LINK_FRACTION {
            info!(download_mbps, upload_mbps, "asymmetric link detected, skipping bidirectional phase");
            return Ok(());
        }

        let (down, up) = tokio::join!(
            self.run_download_saturation(&events_tx),
            self.run_upload_at_tier(UploadTier::classify(upload_mbps), self.config.phase_duration, &events_tx),
        );
        let bidi_mbps = down.unwrap_or(0.0) + up.unwrap_or(0.0);
        let _ = events_tx.send(ThroughputEvent::SweepPhaseComplete { phase: SweepPhase::Bidirectional, mbps: bidi_mbps });
        Ok(())
    }

    /// Sample `GET /ping` every `config.ping_interval` for `duration`,
    /// emitting one [`ThroughputEvent::Ping`] per sample.
    async fn run_ping_phase(
        &self,
        phase: SweepPhase,
        duration: Duration,
        events_tx: &mpsc::UnboundedSender<ThroughputEvent>,
    ) -> Result<(), ClientError> {
        let deadline = Instant::now() + duration;
        let mut interval = tokio::time::interval(self.config.ping_interval);
        while Instant::now() < deadline {
            interval.tick().await;
            if let Ok(rtt) = self.ping_once().await {
                let _ = events_tx.send(ThroughputEvent::Ping { phase, rtt });
            }
        }
        Ok(())
    }

    async fn ping_once(&self) -> Result<Duration, ClientError> {
        let sent = netprobe_core::util::now_unix_ms();
        let start = Instant::now();
        let url = format!("{}/ping?ts={sent}", self.base_url.trim_end_matches('/'));
        self.http.get(&url).send().await?.error_for_status()?;
        Ok(start.elapsed())
    }

    /// Stream `GET /download` for `config.phase_duration`, running a
    /// concurrent ping loop, and return the measured Mbps.
    async fn run_download_saturation(
        &self,
        events_tx: &mpsc::UnboundedSender<ThroughputEvent>,
    ) -> Result<f64, ClientError> {
        let url = format!("{}/download", self.base_url.trim_end_matches('/'));
        let phase_duration = self.config.phase_duration;
        let ping_fut = self.run_ping_phase(SweepPhase::Download, phase_duration, events_tx);

        let download_fut = async {
            let resp = self.http.get(&url).send().await?.error_for_status()?;
            let mut stream = resp.bytes_stream();
            let start = Instant::now();
            let mut total = 0u64;
            while let Some(chunk) = stream.next().await {
                total += chunk?.len() as u64;
                if start.elapsed() >= phase_duration {
                    break;
                }
            }
            Ok::<f64, ClientError>(bytes_to_mbps(total, start.elapsed()))
        };

        let (_, mbps) = tokio::join!(ping_fut, download_fut);
        mbps
    }

    /// Run the §4.7 upload-tiering probe, classify the link, then run the
    /// remaining steady-state upload at the classified tier's chunk size,
    /// returning the measured Mbps.
    async fn run_upload_saturation(
        &self,
        events_tx: &mpsc::UnboundedSender<ThroughputEvent>,
    ) -> Result<f64, ClientError> {
        let tier = self.run_tiering_probe().await?;
        debug!(?tier, "upload tier classified");
        self.run_upload_at_tier(tier, self.config.phase_duration, events_tx).await
    }

    /// Ramp chunk size through [`TIERING_RAMP_BYTES`] for
    /// `config.tiering_probe_duration`, classifying the link by the peak
    /// observed Mbps across all concurrent connections.
    async fn run_tiering_probe(&self) -> Result<UploadTier, ClientError> {
        let pool = std::sync::Arc::new(PayloadPool::from_os_entropy());
        let mut peak_mbps = 0.0f64;
        let deadline = Instant::now() + self.config.tiering_probe_duration;
        let mut step = 0usize;
        while Instant::now() < deadline {
            let chunk_size = TIERING_RAMP_BYTES[step % TIERING_RAMP_BYTES.len()];
            let step_start = Instant::now();
            let mut total = 0u64;
            let uploads: Vec<_> = (0..CONCURRENCY)
                .map(|_| self.upload_once(pool.take(chunk_size)))
                .collect();
            for result in futures::future::join_all(uploads).await {
                total += result.unwrap_or(0);
            }
            let elapsed = step_start.elapsed().max(Duration::from_millis(1));
            peak_mbps = peak_mbps.max(bytes_to_mbps(total, elapsed));
            step += 1;
            tokio::time::sleep(self.config.tiering_step_duration.saturating_sub(elapsed)).await;
        }
        Ok(UploadTier::classify(peak_mbps))
    }

    /// Run `duration` of steady-state upload at `tier`'s max chunk size
    /// with fixed [`CONCURRENCY`]-way concurrency, alongside a ping loop,
    /// returning the measured Mbps.
    async fn run_upload_at_tier(
        &self,
        tier: UploadTier,
        duration: Duration,
        events_tx: &mpsc::UnboundedSender<ThroughputEvent>,
    ) -> Result<f64, ClientError> {
        let pool = std::sync::Arc::new(PayloadPool::from_os_entropy());
        let chunk_size = tier.max_chunk_bytes();
        let phase = SweepPhase::Upload;
        let ping_fut = self.run_ping_phase(phase, duration, events_tx);

        let upload_fut = async {
            let start = Instant::now();
            let mut total = 0u64;
            while start.elapsed() < duration {
                let uploads: Vec<_> = (0..CONCURRENCY)
                    .map(|_| self.upload_once(pool.take(chunk_size)))
                    .collect();
                for result in futures::future::join_all(uploads).await {
                    total += result.unwrap_or(0);
                }
            }
            bytes_to_mbps(total, start.elapsed())
        };

        let (_, mbps) = tokio::join!(ping_fut, upload_fut);
        Ok(mbps)
    }

    async fn upload_once(&self, payload: bytes::Bytes) -> Result<u64, ClientError> {
        let url = format!("{}/upload", self.base_url.trim_end_matches('/'));
        let len = payload.len() as u64;
        self.http.post(&url).body(payload).send().await?.error_for_status()?;
        Ok(len)
    }
}

fn bytes_to_mbps(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    (bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries_match_table() {
        assert_eq!(UploadTier::classify(49.9), UploadTier::Low);
        assert_eq!(UploadTier::classify(50.0), UploadTier::Medium);
        assert_eq!(UploadTier::classify(149.9), UploadTier::Medium);
        assert_eq!(UploadTier::classify(150.0), UploadTier::High);
        assert_eq!(UploadTier::classify(500.0), UploadTier::High);
        assert_eq!(UploadTier::classify(500.1), UploadTier::VeryHigh);
    }

    #[test]
    fn tier_max_chunk_matches_table() {
        assert_eq!(UploadTier::Low.max_chunk_bytes(), 512 * 1024);
        assert_eq!(UploadTier::Medium.max_chunk_bytes(), 1024 * 1024);
        assert_eq!(UploadTier::High.max_chunk_bytes(), 2 * 1024 * 1024);
        assert_eq!(UploadTier::VeryHigh.max_chunk_bytes(), 6 * 1024 * 1024);
    }

    #[test]
    fn default_ping_interval_is_200ms() {
        assert_eq!(SweepConfig::default().ping_interval, Duration::from_millis(200));
    }

    #[test]
    fn bytes_to_mbps_matches_known_value() {
        // 12.5 MB/s == 100 Mbps.
        let mbps = bytes_to_mbps(12_500_000, Duration::from_secs(1));
        assert!((mbps - 100.0).abs() < 0.01);
    }
}
