//! Burst-pattern evaluator: a pure function from
//! `(profile, burst_state, now)` to the currently effective rates.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::profiles::{BurstPattern, TrafficProfile};

/// Which half of a two-phase burst cycle a session is currently in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// High-rate phase (`burst` for netflix_adaptive, `active` for computer_bursty).
    High,
    /// Low-rate phase (`pause` for netflix_adaptive, `background` for computer_bursty).
    Low,
}

/// Mutable per-session burst-cycle state, carried alongside [`TrafficProfile`]
/// (which stays immutable).
#[derive(Clone, Copy, Debug)]
pub struct BurstState {
    /// Current phase.
    pub phase: Phase,
    /// Instant the current phase began.
    pub phase_started_at: Instant,
}

impl BurstState {
    /// Initial state for a freshly created session: phase `High`
    /// ("burst"/"active"), started at session creation time.
    #[must_use]
    pub fn initial(created_at: Instant) -> Self {
        Self {
            phase: Phase::High,
            phase_started_at: created_at,
        }
    }
}

/// Evaluate a profile's burst pattern at `now`, returning the currently
/// effective download/upload rates (in Mbps) and the (possibly advanced)
/// burst state.
///
/// Pure and side-effect-free: no I/O, no shared state. Multiple phase
/// transitions within a single call are folded iteratively, so a
/// pathologically delayed call (well past a scheduler tick) still lands in
/// the phase that would hold had the evaluator been polled continuously,
/// rather than effectively halving the cycle period.
#[must_use]
pub fn evaluate(profile: &TrafficProfile, mut state: BurstState, now: Instant) -> (f64, f64, BurstState) {
    match profile.burst_pattern {
        BurstPattern::Constant => (profile.download_mbps, profile.upload_mbps, state),
        BurstPattern::NetflixAdaptive { burst_s, pause_s, burst_rate, pause_rate } => {
            advance_cycle(&mut state, now, burst_s, pause_s);
            let down = match state.phase {
                Phase::High => burst_rate,
                Phase::Low => pause_rate,
            };
            (down, profile.upload_mbps, state)
        }
        BurstPattern::ComputerBursty { active_s, background_s, active_rate, background_rate } => {
            advance_cycle(&mut state, now, active_s, background_s);
            let down = match state.phase {
                Phase::High => active_rate,
                Phase::Low => background_rate,
            };
            (down, profile.upload_mbps, state)
        }
    }
}

/// Advance `state` through as many phase transitions as have elapsed by
/// `now`, given the duration of the high and low phases.
fn advance_cycle(state: &mut BurstState, now: Instant, high_s: f64, low_s: f64) {
    loop {
        let phase_len = match state.phase {
            Phase::High => high_s,
            Phase::Low => low_s,
        };
        let elapsed = now.saturating_duration_since(state.phase_started_at).as_secs_f64();
        if elapsed < phase_len {
            break;
        }
        let advance = std::time::Duration::from_secs_f64(phase_len);
        state.phase_started_at += advance;
        state.phase = match state.phase {
            Phase::High => Phase::Low,
            Phase::Low => Phase::High,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::TrafficProfile;
    use std::time::Duration;

    #[test]
    fn constant_never_changes() {
        let profile = TrafficProfile::gamer();
        let t0 = Instant::now();
        let state = BurstState::initial(t0);
        let (down, up, new_state) = evaluate(&profile, state, t0 + Duration::from_secs(1000));
        assert_eq!(down, profile.download_mbps);
        assert_eq!(up, profile.upload_mbps);
        assert_eq!(new_state.phase, Phase::High);
    }

    #[test]
    fn netflix_transitions_burst_to_pause() {
        let profile = TrafficProfile::streamer();
        let t0 = Instant::now();
        let state = BurstState::initial(t0);
        // 4s in: still bursting.
        let (down, _, state) = evaluate(&profile, state, t0 + Duration::from_secs(4));
        assert_eq!(down, 25.0);
        // 6s in: should have transitioned into pause.
        let (down, _, state) = evaluate(&profile, state, t0 + Duration::from_secs(6));
        assert_eq!(down, 0.0);
        assert_eq!(state.phase, Phase::Low);
        // 16s in (past burst+pause=15s): back to burst.
        let (down, _, state) = evaluate(&profile, state, t0 + Duration::from_secs(16));
        assert_eq!(down, 25.0);
        assert_eq!(state.phase, Phase::High);
    }

    #[test]
    fn duty_cycle_within_tolerance_over_30s() {
        // Fraction of time in burst should stay within +/-5% of
        // burst_s/(burst_s+pause_s) = 1/3.
        let profile = TrafficProfile::streamer();
        let t0 = Instant::now();
        let mut state = BurstState::initial(t0);
        let mut high_ms: u64 = 0;
        let total_ms: u64 = 30_000;
        let step_ms: u64 = 50;
        let mut t = 0u64;
        while t < total_ms {
            let now = t0 + Duration::from_millis(t);
            let (_, _, new_state) = evaluate(&profile, state, now);
            state = new_state;
            if state.phase == Phase::High {
                high_ms += step_ms;
            }
            t += step_ms;
        }
        let fraction = high_ms as f64 / total_ms as f64;
        assert!((fraction - (5.0 / 15.0)).abs() < 0.05, "fraction={fraction}");
    }

    #[test]
    fn large_gap_still_lands_on_correct_phase() {
        // A tick that is pathologically delayed should still resolve to the
        // phase a continuously-polled evaluator would have reached.
        let profile = TrafficProfile::streamer();
        let t0 = Instant::now();
        let state = BurstState::initial(t0);
        // 5*15 + 6 = 81s -> 81 mod 15 = 6s into a new cycle -> still bursting (burst_s=5)? 6>5 so pause.
        let (down, _, state) = evaluate(&profile, state, t0 + Duration::from_secs(81));
        assert_eq!(down, 0.0);
        assert_eq!(state.phase, Phase::Low);
    }
}
