//! Adaptive warmup (component C5): measures a bulk client's sustained
//! download throughput over a short window before committing to the bulk
//! archetype's `download_mbps`, instead of baking in a fixed canonical rate
//! that would be wrong for the client's actual uplink.

use std::time::Duration;

use crate::config::WarmupConfig;

/// One throughput sample taken during the warmup window: bytes sent since
/// the previous sample, `elapsed` time since that previous sample.
#[derive(Clone, Copy, Debug)]
pub struct WarmupSample {
    /// Bytes sent since the previous sample.
    pub bytes: u64,
    /// Wall-clock time since the previous sample.
    pub elapsed: Duration,
}

impl WarmupSample {
    /// Instantaneous rate this sample represents, in Mbps.
    #[must_use]
    pub fn mbps(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        let bits = self.bytes as f64 * 8.0;
        bits / self.elapsed.as_secs_f64() / 1_000_000.0
    }
}

/// Result of a completed (or abandoned) warmup measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct WarmupResult {
    /// The rate the bulk profile should be pinned to, in Mbps.
    pub download_mbps: f64,
    /// Whether this came from real samples or the configured fallback.
    pub used_fallback: bool,
}

/// Accumulates samples over the warmup window and resolves to a
/// [`WarmupResult`] once enough data is in, or the window elapses.
#[derive(Debug)]
pub struct WarmupMeasurement {
    config: WarmupConfig,
    samples: Vec<WarmupSample>,
}

impl WarmupMeasurement {
    /// Start a new measurement governed by `config`.
    #[must_use]
    pub fn new(config: WarmupConfig) -> Self {
        Self { config, samples: Vec::new() }
    }

    /// Record one sample.
    pub fn record(&mut self, sample: WarmupSample) {
        self.samples.push(sample);
    }

    /// Number of samples recorded so far.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Whether enough samples have been collected to trust a real
    /// measurement, per `config.min_samples`.
    #[must_use]
    pub fn has_enough_samples(&self) -> bool {
        self.samples.len() >= self.config.min_samples
    }

    /// Resolve the measurement to a download rate.
    ///
    /// Uses the p95 of per-sample instantaneous rates rather than the mean,
    /// since a single slow sample (a GC pause, a competing flow) should not
    /// anchor the rest of the session to an artificially low rate, while a
    /// single unrealistically fast sample (TCP slow-start overshoot) should
    /// not anchor it to one either — p95 discards exactly the outliers on
    /// the favorable side while keeping the bulk of the distribution honest.
    /// Falls back to `config.fallback_mbps` if too few samples were
    /// collected.
    #[must_use]
    pub fn resolve(&self) -> WarmupResult {
        if !self.has_enough_samples() {
            return WarmupResult { download_mbps: self.config.fallback_mbps, used_fallback: true };
        }
        let download_mbps = percentile95(&self.samples);
        WarmupResult { download_mbps, used_fallback: false }
    }
}

/// Pure p95 computation over a sample sequence, exposed standalone so the
/// scheduler and tests can evaluate it without owning a [`WarmupMeasurement`].
#[must_use]
pub fn percentile95(samples: &[WarmupSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut rates: Vec<f64> = samples.iter().map(WarmupSample::mbps).collect();
    rates.sort_by(|a, b| a.partial_cmp(b).expect("rates are never NaN"));
    let idx = ((rates.len() as f64) * 0.95).floor() as usize;
    rates[idx.min(rates.len() - 1)]
}

/// Peak (maximum) instantaneous rate seen across `samples`, used for
/// diagnostics (e.g. `/stats`) rather than profile pinning.
#[must_use]
pub fn peak(samples: &[WarmupSample]) -> f64 {
    samples
        .iter()
        .map(WarmupSample::mbps)
        .fold(0.0_f64, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mbps: f64) -> WarmupSample {
        // bytes = mbps * 1_000_000 / 8 * elapsed_secs, elapsed fixed at 0.25s.
        let elapsed = Duration::from_millis(250);
        let bytes = (mbps * 1_000_000.0 / 8.0 * elapsed.as_secs_f64()) as u64;
        WarmupSample { bytes, elapsed }
    }

    #[test]
    fn too_few_samples_falls_back() {
        let cfg = WarmupConfig::default();
        let mut m = WarmupMeasurement::new(cfg.clone());
        for _ in 0..5 {
            m.record(sample(300.0));
        }
        let result = m.resolve();
        assert!(result.used_fallback);
        assert_eq!(result.download_mbps, cfg.fallback_mbps);
    }

    #[test]
    fn enough_samples_uses_p95_not_mean() {
        let mut cfg = WarmupConfig::default();
        cfg.min_samples = 20;
        let mut m = WarmupMeasurement::new(cfg);
        for _ in 0..19 {
            m.record(sample(100.0));
        }
        m.record(sample(1000.0));
        let result = m.resolve();
        assert!(!result.used_fallback);
        // p95 of 20 samples (19 low, 1 high outlier) should land on a low
        // sample, not be dragged up by the single spike.
        assert!((result.download_mbps - 100.0).abs() < 1.0);
    }

    #[test]
    fn peak_tracks_the_maximum_sample() {
        let samples = vec![sample(50.0), sample(300.0), sample(120.0)];
        assert!((peak(&samples) - 300.0).abs() < 1.0);
    }

    #[test]
    fn mbps_is_zero_for_zero_elapsed() {
        let s = WarmupSample { bytes: 1000, elapsed: Duration::ZERO };
        assert_eq!(s.mbps(), 0.0);
    }
}
