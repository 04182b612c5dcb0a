//! Application configuration structures.

use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{archetype::UserArchetype, logging::LoggingConfig, profiles::BulkProfileConfig};

/// Top-level application configuration, shared (with archetype-specific
/// overlays) by the supervisor and every user process.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct AppConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// TLS certificate/key paths, shared by the supervisor and every child.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Port assignment for each archetype's dedicated user process.
    #[serde(default)]
    pub ports: PortConfig,
    /// Session manager / background traffic loop tunables.
    #[serde(default)]
    pub session: SessionConfig,
    /// Adaptive warmup tunables.
    #[serde(default)]
    pub warmup: WarmupConfig,
    /// Rate limiter tunables.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Bulk archetype profile tunables.
    #[serde(default)]
    pub bulk_profile: BulkProfileConfig,
    /// Supervisor child-process management tunables.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Short application name, used in the `Server:` HTTP header.
    #[serde(skip)]
    pub app_name: Option<String>,
    /// Application version, preferably semver.
    #[serde(skip)]
    pub app_version: Option<String>,
}

impl AppConfig {
    /// Set the application's short name.
    ///
    /// Whitespace is not allowed, as this value is used in the `Server:`
    /// HTTP header, among other things.
    #[must_use]
    pub fn with_app_name(&mut self, app_name: impl ToString) -> &mut Self {
        self.app_name = Some(app_name.to_string());
        self
    }

    /// Set the application's version.
    #[must_use]
    pub fn with_app_version(&mut self, app_version: impl ToString) -> &mut Self {
        self.app_version = Some(app_version.to_string());
        self
    }
}

/// TLS certificate/key file paths.
///
/// Left unset, the supervisor and user processes fall back to plain `ws`/
/// `http`; ACME acquisition and renewal are an external collaborator, not
/// this crate's concern.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TlsConfig {
    /// Path to a PEM certificate chain.
    #[serde(default)]
    pub cert_file: Option<String>,
    /// Path to a PEM private key.
    #[serde(default)]
    pub key_file: Option<String>,
}

impl TlsConfig {
    /// Whether both a certificate and a key have been configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

/// Port assignment for the supervisor and each archetype's child process.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PortConfig {
    /// Supervisor's own listening port.
    #[serde(default = "PortConfig::default_supervisor_port")]
    pub supervisor_port: u16,
    /// Base port for archetype child processes.
    ///
    /// Individual archetype ports are `base_port + offset`, via
    /// [`UserArchetype::default_port`].
    #[serde(default = "PortConfig::default_base_port")]
    pub base_port: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            supervisor_port: Self::default_supervisor_port(),
            base_port: Self::default_base_port(),
        }
    }
}

impl PortConfig {
    #[must_use]
    #[inline]
    fn default_supervisor_port() -> u16 {
        8000
    }

    #[must_use]
    #[inline]
    fn default_base_port() -> u16 {
        8001
    }

    /// Externally visible port for `archetype`'s dedicated process.
    #[must_use]
    pub fn port_for(&self, archetype: UserArchetype) -> u16 {
        archetype.default_port(self.base_port)
    }
}

/// Session manager / background traffic loop tunables (component C3).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Cadence of the background scheduler tick.
    #[serde(default = "SessionConfig::default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Maximum idle time before a session is terminated (I2).
    #[serde(default = "SessionConfig::default_inactivity_timeout", with = "humantime_serde")]
    pub inactivity_timeout: Duration,
    /// Maximum session lifetime before forced termination (I3).
    #[serde(default = "SessionConfig::default_max_duration", with = "humantime_serde")]
    pub max_session_duration: Duration,
    /// Idle time after which a connection liveness probe is sent.
    #[serde(default = "SessionConfig::default_probe_threshold", with = "humantime_serde")]
    pub probe_threshold: Duration,
    /// Reply deadline for a single liveness probe.
    #[serde(default = "SessionConfig::default_probe_deadline", with = "humantime_serde")]
    pub probe_deadline: Duration,
    /// Consecutive missed probes before termination (I4).
    #[serde(default = "SessionConfig::default_max_ping_failures")]
    pub max_ping_failures: u32,
    /// Maximum concurrent sessions per process.
    #[serde(default = "SessionConfig::default_per_process_cap")]
    pub per_process_cap: usize,
    /// Consecutive slow ticks before `per_process_cap` is reduced.
    #[serde(default = "SessionConfig::default_slow_tick_threshold")]
    pub slow_tick_threshold: u32,
    /// Consecutive on-budget ticks required before a reduced cap is restored.
    #[serde(default = "SessionConfig::default_slow_tick_restore")]
    pub slow_tick_restore: u32,
    /// Multiple of `tick_interval` a tick's wall-clock duration must exceed
    /// to count as "slow".
    #[serde(default = "SessionConfig::default_slow_tick_factor")]
    pub slow_tick_factor: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Self::default_tick_interval(),
            inactivity_timeout: Self::default_inactivity_timeout(),
            max_session_duration: Self::default_max_duration(),
            probe_threshold: Self::default_probe_threshold(),
            probe_deadline: Self::default_probe_deadline(),
            max_ping_failures: Self::default_max_ping_failures(),
            per_process_cap: Self::default_per_process_cap(),
            slow_tick_threshold: Self::default_slow_tick_threshold(),
            slow_tick_restore: Self::default_slow_tick_restore(),
            slow_tick_factor: Self::default_slow_tick_factor(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    #[inline]
    fn default_tick_interval() -> Duration {
        Duration::from_millis(250)
    }

    #[must_use]
    #[inline]
    fn default_inactivity_timeout() -> Duration {
        Duration::from_secs(30)
    }

    #[must_use]
    #[inline]
    fn default_max_duration() -> Duration {
        Duration::from_secs(300)
    }

    #[must_use]
    #[inline]
    fn default_probe_threshold() -> Duration {
        Duration::from_secs(10)
    }

    #[must_use]
    #[inline]
    fn default_probe_deadline() -> Duration {
        Duration::from_secs(1)
    }

    #[must_use]
    #[inline]
    fn default_max_ping_failures() -> u32 {
        3
    }

    #[must_use]
    #[inline]
    fn default_per_process_cap() -> usize {
        50
    }

    #[must_use]
    #[inline]
    fn default_slow_tick_threshold() -> u32 {
        5
    }

    #[must_use]
    #[inline]
    fn default_slow_tick_restore() -> u32 {
        20
    }

    #[must_use]
    #[inline]
    fn default_slow_tick_factor() -> f64 {
        2.0
    }
}

/// Adaptive warmup tunables (component C5).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct WarmupConfig {
    /// Total duration of the warmup measurement window.
    #[serde(default = "WarmupConfig::default_duration", with = "humantime_serde")]
    pub duration: Duration,
    /// Sampling interval within the warmup window.
    #[serde(default = "WarmupConfig::default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Minimum sample count required to trust a measurement.
    #[serde(default = "WarmupConfig::default_min_samples")]
    pub min_samples: usize,
    /// Fallback download rate, in Mbps, used after two failed attempts.
    #[serde(default = "WarmupConfig::default_fallback_mbps")]
    pub fallback_mbps: f64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            duration: Self::default_duration(),
            sample_interval: Self::default_sample_interval(),
            min_samples: Self::default_min_samples(),
            fallback_mbps: Self::default_fallback_mbps(),
        }
    }
}

impl WarmupConfig {
    #[must_use]
    #[inline]
    fn default_duration() -> Duration {
        Duration::from_secs(10)
    }

    #[must_use]
    #[inline]
    fn default_sample_interval() -> Duration {
        Duration::from_millis(250)
    }

    #[must_use]
    #[inline]
    fn default_min_samples() -> usize {
        20
    }

    #[must_use]
    #[inline]
    fn default_fallback_mbps() -> f64 {
        200.0
    }
}

/// Rate limiter tunables (component C7).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct RateLimitConfig {
    /// Maximum completed HTTP downloads per client address per rolling hour.
    #[serde(default = "RateLimitConfig::default_max_downloads_per_hour")]
    pub max_downloads_per_hour: u32,
    /// Maximum cumulative HTTP download bytes per client address per rolling
    /// hour.
    #[serde(default = "RateLimitConfig::default_max_bytes_per_hour")]
    pub max_bytes_per_hour: u64,
    /// Maximum concurrent WS sessions per client address per archetype.
    #[serde(default = "RateLimitConfig::default_max_concurrent_per_archetype")]
    pub max_concurrent_per_archetype: u32,
    /// Maximum concurrent WS sessions per client address across all
    /// archetypes (the NAT allowance).
    #[serde(default = "RateLimitConfig::default_max_concurrent_total")]
    pub max_concurrent_total: u32,
    /// Janitor sweep interval.
    #[serde(default = "RateLimitConfig::default_janitor_interval", with = "humantime_serde")]
    pub janitor_interval: Duration,
    /// Coarse per-address connection-attempt rate used by the `governor`
    /// flood prefilter, in attempts per second.
    #[serde(default = "RateLimitConfig::default_flood_attempts_per_sec")]
    pub flood_attempts_per_sec: u32,
    /// Addresses exempt from both the exact budget tracker and the flood
    /// prefilter, e.g. loopback during local development.
    #[serde(default)]
    pub exempt_addresses: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_downloads_per_hour: Self::default_max_downloads_per_hour(),
            max_bytes_per_hour: Self::default_max_bytes_per_hour(),
            max_concurrent_per_archetype: Self::default_max_concurrent_per_archetype(),
            max_concurrent_total: Self::default_max_concurrent_total(),
            janitor_interval: Self::default_janitor_interval(),
            flood_attempts_per_sec: Self::default_flood_attempts_per_sec(),
            exempt_addresses: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    #[inline]
    fn default_max_downloads_per_hour() -> u32 {
        16
    }

    #[must_use]
    #[inline]
    fn default_max_bytes_per_hour() -> u64 {
        45 * 1024 * 1024 * 1024
    }

    #[must_use]
    #[inline]
    fn default_max_concurrent_per_archetype() -> u32 {
        4
    }

    #[must_use]
    #[inline]
    fn default_max_concurrent_total() -> u32 {
        16
    }

    #[must_use]
    #[inline]
    fn default_janitor_interval() -> Duration {
        Duration::from_secs(600)
    }

    #[must_use]
    #[inline]
    fn default_flood_attempts_per_sec() -> u32 {
        5
    }
}

/// Supervisor child-process management tunables (component C1).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct SupervisorConfig {
    /// Health-poll interval for each child process.
    #[serde(default = "SupervisorConfig::default_health_poll_interval", with = "humantime_serde")]
    pub health_poll_interval: Duration,
    /// Consecutive health-check failures before a child is respawned.
    #[serde(default = "SupervisorConfig::default_max_health_failures")]
    pub max_health_failures: u32,
    /// Maximum respawn attempts before giving up on a child permanently.
    #[serde(default = "SupervisorConfig::default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Base delay for the respawn backoff (doubles each attempt).
    #[serde(default = "SupervisorConfig::default_restart_backoff_base", with = "humantime_serde")]
    pub restart_backoff_base: Duration,
    /// Graceful shutdown grace period before a child is force-killed.
    #[serde(default = "SupervisorConfig::default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_poll_interval: Self::default_health_poll_interval(),
            max_health_failures: Self::default_max_health_failures(),
            max_restart_attempts: Self::default_max_restart_attempts(),
            restart_backoff_base: Self::default_restart_backoff_base(),
            shutdown_grace: Self::default_shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    #[inline]
    fn default_health_poll_interval() -> Duration {
        Duration::from_secs(5)
    }

    #[must_use]
    #[inline]
    fn default_max_health_failures() -> u32 {
        3
    }

    #[must_use]
    #[inline]
    fn default_max_restart_attempts() -> u32 {
        5
    }

    #[must_use]
    #[inline]
    fn default_restart_backoff_base() -> Duration {
        Duration::from_millis(250)
    }

    #[must_use]
    #[inline]
    fn default_shutdown_grace() -> Duration {
        Duration::from_secs(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_config_assigns_expected_defaults() {
        let ports = PortConfig::default();
        assert_eq!(ports.supervisor_port, 8000);
        assert_eq!(ports.port_for(UserArchetype::Gamer), 8001);
        assert_eq!(ports.port_for(UserArchetype::Bulk), 8004);
    }

    #[test]
    fn rate_limit_defaults_match_canonical_budgets() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.max_downloads_per_hour, 16);
        assert_eq!(cfg.max_bytes_per_hour, 45 * 1024 * 1024 * 1024);
        assert_eq!(cfg.max_concurrent_per_archetype, 4);
        assert_eq!(cfg.max_concurrent_total, 16);
    }

    #[test]
    fn tls_is_enabled_requires_both_paths() {
        let mut tls = TlsConfig::default();
        assert!(!tls.is_enabled());
        tls.cert_file = Some("cert.pem".into());
        assert!(!tls.is_enabled());
        tls.key_file = Some("key.pem".into());
        assert!(tls.is_enabled());
    }
}
