//! NAT-aware rate limiting (component C7).
//!
//! Two layers sit in front of every download and every WS upgrade:
//!
//! - A coarse, cheap `governor` GCRA prefilter on raw connection attempts per
//!   address, meant to absorb a flood before it ever reaches the exact
//!   accounting below.
//! - An exact budget tracker keyed by client address, covering completed HTTP
//!   downloads (count and bytes, rolling hour) and concurrent WS sessions
//!   (per archetype and in total), since a NAT gateway can front many real
//!   users behind one address and the limiter must not punish all of them for
//!   one user's behavior.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};

use governor::{Quota, RateLimiter as GovernorRateLimiter};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace_span, Instrument};

use crate::{archetype::UserArchetype, config::RateLimitConfig};

/// Why a request was refused by the rate limiter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RateLimitDenial {
    /// The coarse flood prefilter rejected this connection attempt.
    FloodPrefilter,
    /// The address has already completed `max_downloads_per_hour` downloads
    /// within the current rolling hour.
    DownloadCountExceeded,
    /// The address has already transferred `max_bytes_per_hour` within the
    /// current rolling hour.
    ByteBudgetExceeded,
    /// The address already has `max_concurrent_per_archetype` open sessions
    /// for the requested archetype.
    ArchetypeConcurrencyExceeded,
    /// The address already has `max_concurrent_total` open sessions across
    /// all archetypes.
    TotalConcurrencyExceeded,
}

/// Length of the rolling window the download count and byte budgets are
/// tracked over.
const BUDGET_WINDOW: Duration = Duration::from_secs(3600);

/// One byte-affecting event within the rolling window: when it happened,
/// how many bytes it contributed, and whether it counts toward the
/// download-count budget (a completed download) or only the byte budget
/// (incremental bytes reported against a download already counted, e.g. a
/// long-lived stream's progress).
#[derive(Debug)]
struct BudgetEvent {
    at: Instant,
    bytes: u64,
    counts_as_download: bool,
}

/// Per-address exact accounting. Bytes/downloads are tracked as an ordered
/// deque of events within a true sliding window: each check expires entries
/// older than [`BUDGET_WINDOW`] before evaluating or recording, so the
/// budget never resets wholesale at a fixed boundary.
#[derive(Debug, Default)]
struct ClientBudget {
    events: VecDeque<BudgetEvent>,
    sessions_by_archetype: HashMap<UserArchetype, u32>,
    sessions_total: u32,
}

impl ClientBudget {
    /// Drop events older than `window`, relative to `now`.
    fn expire_events(&mut self, now: Instant, window: Duration) {
        while let Some(event) = self.events.front() {
            if now.saturating_duration_since(event.at) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn downloads_in_window(&self) -> u32 {
        self.events.iter().filter(|e| e.counts_as_download).count() as u32
    }

    fn bytes_in_window(&self) -> u64 {
        self.events.iter().map(|e| e.bytes).sum()
    }

    fn is_idle(&self) -> bool {
        self.sessions_total == 0 && self.events.is_empty()
    }
}

/// NAT-aware rate limiter shared by a user process's HTTP download handler
/// and WS upgrade handler.
pub struct RateLimiter {
    config: RateLimitConfig,
    budgets: Mutex<HashMap<IpAddr, ClientBudget>>,
    flood: governor::DefaultKeyedRateLimiter<IpAddr>,
}

impl RateLimiter {
    /// Build a limiter from `config`.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let per_sec = NonZeroU32::new(config.flood_attempts_per_sec.max(1))
            .unwrap_or_else(|| NonZeroU32::new(1).expect("1 is nonzero"));
        let flood = GovernorRateLimiter::keyed(Quota::per_second(per_sec));
        Self {
            config,
            budgets: Mutex::new(HashMap::new()),
            flood,
        }
    }

    fn is_exempt(&self, addr: IpAddr) -> bool {
        self.config.exempt_addresses.contains(&addr)
    }

    /// Check the coarse flood prefilter for a raw connection attempt from
    /// `addr`. Cheap enough to call before any exact accounting.
    #[must_use]
    pub fn check_flood_prefilter(&self, addr: IpAddr) -> Result<(), RateLimitDenial> {
        if self.is_exempt(addr) {
            return Ok(());
        }
        self.flood
            .check_key(&addr)
            .map_err(|_| RateLimitDenial::FloodPrefilter)
    }

    /// Check and, if allowed, record one completed HTTP download of `bytes`
    /// from `addr`.
    pub fn check_and_record_download(&self, addr: IpAddr, bytes: u64) -> Result<(), RateLimitDenial> {
        if self.is_exempt(addr) {
            return Ok(());
        }
        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(addr).or_default();
        budget.expire_events(now, BUDGET_WINDOW);
        if budget.downloads_in_window() >= self.config.max_downloads_per_hour {
            return Err(RateLimitDenial::DownloadCountExceeded);
        }
        if budget.bytes_in_window().saturating_add(bytes) > self.config.max_bytes_per_hour {
            return Err(RateLimitDenial::ByteBudgetExceeded);
        }
        budget.events.push_back(BudgetEvent { at: now, bytes, counts_as_download: true });
        Ok(())
    }

    /// Check and, if allowed, reserve one concurrent WS session slot for
    /// `archetype` at `addr`. Pair with [`Self::release_session`] once the
    /// session terminates.
    pub fn check_and_reserve_session(
        &self,
        addr: IpAddr,
        archetype: UserArchetype,
    ) -> Result<(), RateLimitDenial> {
        if self.is_exempt(addr) {
            return Ok(());
        }
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(addr).or_default();
        if budget.sessions_total >= self.config.max_concurrent_total {
            return Err(RateLimitDenial::TotalConcurrencyExceeded);
        }
        let per_archetype = budget.sessions_by_archetype.entry(archetype).or_insert(0);
        if *per_archetype >= self.config.max_concurrent_per_archetype {
            return Err(RateLimitDenial::ArchetypeConcurrencyExceeded);
        }
        *per_archetype += 1;
        budget.sessions_total += 1;
        Ok(())
    }

    /// Record additional bytes against an address's rolling-hour byte
    /// budget without counting another download, for a long-lived stream
    /// (e.g. `/download`) that registered one download up front and then
    /// reports its actual transferred bytes incrementally.
    pub fn check_additional_bytes(&self, addr: IpAddr, bytes: u64) -> Result<(), RateLimitDenial> {
        if self.is_exempt(addr) {
            return Ok(());
        }
        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        let budget = budgets.entry(addr).or_default();
        budget.expire_events(now, BUDGET_WINDOW);
        if budget.bytes_in_window().saturating_add(bytes) > self.config.max_bytes_per_hour {
            return Err(RateLimitDenial::ByteBudgetExceeded);
        }
        budget.events.push_back(BudgetEvent { at: now, bytes, counts_as_download: false });
        Ok(())
    }

    /// Release a previously reserved session slot. A no-op for exempt
    /// addresses or addresses with no tracked budget (defensive against a
    /// double release).
    pub fn release_session(&self, addr: IpAddr, archetype: UserArchetype) {
        if self.is_exempt(addr) {
            return;
        }
        let mut budgets = self.budgets.lock();
        if let Some(budget) = budgets.get_mut(&addr) {
            if let Some(count) = budget.sessions_by_archetype.get_mut(&archetype) {
                *count = count.saturating_sub(1);
            }
            budget.sessions_total = budget.sessions_total.saturating_sub(1);
        }
    }

    /// Sweep idle entries (no open sessions, no downloads in the last hour)
    /// out of the budget map, so a limiter that has seen many distinct
    /// addresses doesn't grow unbounded.
    fn sweep(&self) {
        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        let before = budgets.len();
        for budget in budgets.values_mut() {
            budget.expire_events(now, BUDGET_WINDOW);
        }
        budgets.retain(|_, budget| !budget.is_idle());
        let removed = before - budgets.len();
        if removed > 0 {
            debug!(removed, remaining = budgets.len(), "rate limiter janitor swept idle entries");
        }
    }

    /// Run the janitor loop forever at `config.janitor_interval`. Intended to
    /// be spawned once per process via [`tokio::spawn`].
    pub async fn run_janitor(self: Arc<Self>) {
        let span = trace_span!("rate_limiter_janitor");
        async move {
            let mut timer = tokio::time::interval(self.config.janitor_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                self.sweep();
            }
        }
        .instrument(span)
        .await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn sliding_window_keeps_events_straddling_a_tumbling_boundary() {
        // A tumbling window anchored at t0 would reset wholesale at
        // t0+3600s, letting a fresh batch of downloads land right after the
        // reset even though they're seconds away from the first batch. The
        // sliding window must instead keep counting both batches together
        // until the first batch actually ages out.
        let mut budget = ClientBudget::default();
        let t0 = Instant::now();
        for _ in 0..16 {
            budget.events.push_back(BudgetEvent { at: t0, bytes: 0, counts_as_download: true });
        }
        assert_eq!(budget.downloads_in_window(), 16);

        // A tumbling window would have reset by here; a sliding one hasn't.
        let just_after_reset = t0 + Duration::from_secs(2);
        budget.expire_events(just_after_reset, BUDGET_WINDOW);
        assert_eq!(budget.downloads_in_window(), 16);

        // Once the first batch is actually older than the window, it expires.
        let past_window = t0 + BUDGET_WINDOW + Duration::from_secs(1);
        budget.expire_events(past_window, BUDGET_WINDOW);
        assert_eq!(budget.downloads_in_window(), 0);
    }

    fn addr(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn download_count_budget_trips_after_limit() {
        let mut cfg = RateLimitConfig::default();
        cfg.max_downloads_per_hour = 2;
        let limiter = RateLimiter::new(cfg);
        let a = addr(1);
        assert!(limiter.check_and_record_download(a, 1024).is_ok());
        assert!(limiter.check_and_record_download(a, 1024).is_ok());
        assert_eq!(
            limiter.check_and_record_download(a, 1024),
            Err(RateLimitDenial::DownloadCountExceeded)
        );
    }

    #[test]
    fn byte_budget_trips_before_count_if_smaller() {
        let mut cfg = RateLimitConfig::default();
        cfg.max_bytes_per_hour = 1000;
        cfg.max_downloads_per_hour = 100;
        let limiter = RateLimiter::new(cfg);
        let a = addr(2);
        assert!(limiter.check_and_record_download(a, 500).is_ok());
        assert_eq!(
            limiter.check_and_record_download(a, 600),
            Err(RateLimitDenial::ByteBudgetExceeded)
        );
    }

    #[test]
    fn concurrent_sessions_respect_per_archetype_and_total_caps() {
        let mut cfg = RateLimitConfig::default();
        cfg.max_concurrent_per_archetype = 1;
        cfg.max_concurrent_total = 3;
        let limiter = RateLimiter::new(cfg);
        let a = addr(3);
        assert!(limiter.check_and_reserve_session(a, UserArchetype::Gamer).is_ok());
        assert_eq!(
            limiter.check_and_reserve_session(a, UserArchetype::Gamer),
            Err(RateLimitDenial::ArchetypeConcurrencyExceeded)
        );
        assert!(limiter.check_and_reserve_session(a, UserArchetype::Streamer).is_ok());
        assert!(limiter.check_and_reserve_session(a, UserArchetype::Bulk).is_ok());
        assert_eq!(
            limiter.check_and_reserve_session(a, UserArchetype::VideoCaller),
            Err(RateLimitDenial::TotalConcurrencyExceeded)
        );
    }

    #[test]
    fn releasing_a_session_frees_its_slot() {
        let mut cfg = RateLimitConfig::default();
        cfg.max_concurrent_per_archetype = 1;
        let limiter = RateLimiter::new(cfg);
        let a = addr(4);
        limiter.check_and_reserve_session(a, UserArchetype::Gamer).unwrap();
        limiter.release_session(a, UserArchetype::Gamer);
        assert!(limiter.check_and_reserve_session(a, UserArchetype::Gamer).is_ok());
    }

    #[test]
    fn additional_bytes_trips_the_same_budget_without_counting_a_download() {
        let mut cfg = RateLimitConfig::default();
        cfg.max_bytes_per_hour = 1000;
        let limiter = RateLimiter::new(cfg);
        let a = addr(6);
        assert!(limiter.check_and_record_download(a, 0).is_ok());
        assert!(limiter.check_additional_bytes(a, 500).is_ok());
        assert!(limiter.check_additional_bytes(a, 400).is_ok());
        assert_eq!(limiter.check_additional_bytes(a, 200), Err(RateLimitDenial::ByteBudgetExceeded));
    }

    #[test]
    fn exempt_addresses_bypass_every_check() {
        let mut cfg = RateLimitConfig::default();
        cfg.max_downloads_per_hour = 0;
        cfg.exempt_addresses = vec![addr(5)];
        let limiter = RateLimiter::new(cfg);
        assert!(limiter.check_and_record_download(addr(5), u64::MAX).is_ok());
    }
}
