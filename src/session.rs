//! `TrafficSession` data model: the per-connection state the scheduler (C3)
//! evaluates and mutates on every tick.

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    archetype::UserArchetype,
    burst::BurstState,
    config::SessionConfig,
    profiles::TrafficProfile,
    protocol::ControlFrame,
};

/// Why a session transitioned to [`SessionStatus::Terminal`].
///
/// Consistently tags session removal, `/stats` counters, and end-to-end
/// scenario assertions across the codebase.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TerminationReason {
    /// `now - last_activity` exceeded the inactivity timeout (I2).
    Inactive,
    /// `now - created_at` exceeded the maximum session duration (I3).
    Expired,
    /// Consecutive liveness-probe failures exceeded the threshold (I4).
    Unreachable,
    /// A write to the underlying connection failed.
    SendError,
    /// The connection reported itself closed.
    Closed,
    /// The client sent a frame that could not be interpreted.
    ProtocolViolation,
    /// The process is shutting down.
    Shutdown,
}

/// Current lifecycle state of a session (I1: a session is either active,
/// draining, or terminal; only terminal sessions are eligible for removal).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SessionStatus {
    /// Normal operation: eligible for traffic generation.
    Active,
    /// Shutting down gracefully; no new traffic is scheduled, but the
    /// connection is kept open until drained.
    Draining,
    /// Terminated; eligible for removal from the active session map.
    Terminal(TerminationReason),
}

impl SessionStatus {
    /// Whether this status is [`SessionStatus::Terminal`].
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// A liveness probe awaiting its reply.
///
/// Reconciliation is by `probe_id`, not by tick: replies may arrive out of
/// order with respect to scheduler ticks.
#[derive(Clone, Copy, Debug)]
pub struct ProbeRecord {
    /// Opaque id echoed back in the client's reply.
    pub probe_id: u64,
    /// When the probe was sent.
    pub sent_at: Instant,
}

/// Connection-health bookkeeping for a session.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionHealth {
    /// Consecutive probes that missed their reply deadline (I4).
    pub consecutive_ping_failures: u32,
    /// The probe currently awaiting a reply, if any.
    pub test_in_flight: Option<ProbeRecord>,
}

/// Error returned by a [`SessionSink`] write.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionSinkError {
    /// The underlying connection rejected the write (backpressure failure,
    /// reset, or closed).
    #[error("send failed: connection closed or backpressured")]
    Closed,
}

/// Abstraction over the underlying WS connection a session writes to.
///
/// Kept as a trait so the scheduler's hot tick loop (this crate) never
/// depends on `axum`'s WebSocket types directly; the user-process binary
/// supplies the real implementation backed by an `mpsc` channel to the
/// connection's write task.
///
/// Sends are synchronous and non-blocking by contract: an implementation
/// must never await inside these methods, since the traffic step is not
/// allowed to suspend between cleanup and send beyond the necessary I/O.
pub trait SessionSink: Send + Sync {
    /// Send a binary frame (`download_chunk`/header-prefixed payload).
    ///
    /// # Errors
    ///
    /// Returns `Err` if the write is rejected; the caller must treat this as
    /// an immediate, same-tick termination with no retry.
    fn send_binary(&self, frame: Bytes) -> Result<(), SessionSinkError>;

    /// Send a small JSON control frame.
    ///
    /// # Errors
    ///
    /// See [`Self::send_binary`].
    fn send_control(&self, frame: &ControlFrame) -> Result<(), SessionSinkError>;

    /// Whether the underlying connection is still open, from this side's
    /// point of view.
    fn is_open(&self) -> bool;
}

/// One client <-> user-process persistent streaming connection with its
/// associated profile and health state.
pub struct TrafficSession {
    /// Unique session identifier.
    pub session_id: Uuid,
    /// Which archetype this session belongs to (matches the owning process).
    pub archetype: UserArchetype,
    /// Client's observed address, used for rate-limit accounting.
    pub client_addr: IpAddr,
    /// Immutable traffic profile bound to this session's archetype.
    pub profile: TrafficProfile,
    /// Where outbound frames are written.
    ///
    /// `Arc`, not `Box`: the scheduler's traffic step clones this handle out
    /// of the session map before pacing sub-tick packets with real sleeps,
    /// so it never holds the map's per-entry lock across an `.await` (doing
    /// so on a single-threaded per-process runtime would let one session's
    /// pacing sleep stall every other task, including the WS read task
    /// trying to lock that same entry).
    pub sink: Arc<dyn SessionSink>,
    /// When the session was created.
    pub created_at: Instant,
    /// Last time any activity (inbound frame, successful send) was observed.
    pub last_activity: Instant,
    /// Mutable burst-cycle phase state, evaluated against `profile` each
    /// tick by [`crate::burst::evaluate`].
    pub burst_state: BurstState,
    /// Cumulative download bytes emitted.
    pub bytes_sent_down: u64,
    /// Cumulative upload bytes requested of the client.
    pub bytes_requested_up: u64,
    /// Cumulative upload bytes actually received from the client.
    pub bytes_received_up: u64,
    /// Connection-health bookkeeping.
    pub health: SessionHealth,
    /// Current lifecycle state.
    status: SessionStatus,
    /// Next outbound frame sequence number (strictly monotonic per session).
    next_seq: u32,
}

impl TrafficSession {
    /// Create a new session in [`SessionStatus::Active`], with burst state
    /// initialized to the profile's starting phase.
    #[must_use]
    pub fn new(
        session_id: Uuid,
        archetype: UserArchetype,
        client_addr: IpAddr,
        profile: TrafficProfile,
        sink: Arc<dyn SessionSink>,
        now: Instant,
    ) -> Self {
        Self {
            session_id,
            archetype,
            client_addr,
            profile,
            sink,
            created_at: now,
            last_activity: now,
            burst_state: BurstState::initial(now),
            bytes_sent_down: 0,
            bytes_requested_up: 0,
            bytes_received_up: 0,
            health: SessionHealth::default(),
            status: SessionStatus::Active,
            next_seq: 0,
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether this session is eligible for traffic generation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Active)
    }

    /// Whether this session is eligible for removal from the active map.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to terminal with `reason`, unless already terminal.
    ///
    /// Once terminal, no further bytes are ever emitted for this session
    /// (I6): callers must stop scheduling traffic for it in the same tick
    /// this is called.
    pub fn mark_terminal(&mut self, reason: TerminationReason) {
        if !self.status.is_terminal() {
            self.status = SessionStatus::Terminal(reason);
        }
    }

    /// Mark this session as draining (graceful shutdown in progress).
    pub fn mark_draining(&mut self) {
        if matches!(self.status, SessionStatus::Active) {
            self.status = SessionStatus::Draining;
        }
    }

    /// Record activity (inbound frame, successful send) at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Allocate the next monotonic sequence number for an outbound frame.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Evaluate I2/I3/I4 against `now` and `cfg`, transitioning to terminal
    /// and returning the reason if any invariant is violated.
    ///
    /// Cleanup-first ordering requires this to run, for every session,
    /// strictly before any traffic step in the same tick.
    pub fn check_invariants(
        &mut self,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Option<TerminationReason> {
        if self.status.is_terminal() {
            return None;
        }
        if now.saturating_duration_since(self.last_activity) > cfg.inactivity_timeout {
            self.mark_terminal(TerminationReason::Inactive);
            return Some(TerminationReason::Inactive);
        }
        if now.saturating_duration_since(self.created_at) > cfg.max_session_duration {
            self.mark_terminal(TerminationReason::Expired);
            return Some(TerminationReason::Expired);
        }
        if self.health.consecutive_ping_failures > cfg.max_ping_failures {
            self.mark_terminal(TerminationReason::Unreachable);
            return Some(TerminationReason::Unreachable);
        }
        None
    }

    /// Whether a liveness probe should be sent: idle for longer than
    /// `probe_threshold` and no probe currently in flight.
    #[must_use]
    pub fn needs_probe(&self, now: Instant, probe_threshold: Duration) -> bool {
        self.health.test_in_flight.is_none()
            && now.saturating_duration_since(self.last_activity) >= probe_threshold
    }

    /// Record that a probe with `probe_id` was sent at `now`.
    pub fn record_probe_sent(&mut self, probe_id: u64, now: Instant) {
        self.health.test_in_flight = Some(ProbeRecord { probe_id, sent_at: now });
    }

    /// Reconcile a `connection_test_reply` with `probe_id`.
    ///
    /// Returns `true` if it matched the in-flight probe (resetting the
    /// failure streak); out-of-order replies for a probe that already timed
    /// out and was superseded are ignored, matching the "reconciliation is
    /// by probe id, not by time" rule.
    pub fn reconcile_probe_reply(&mut self, probe_id: u64) -> bool {
        if self.health.test_in_flight.is_some_and(|p| p.probe_id == probe_id) {
            self.health.test_in_flight = None;
            self.health.consecutive_ping_failures = 0;
            true
        } else {
            false
        }
    }

    /// Evaluate the in-flight probe (if any) against `deadline`, counting a
    /// missed deadline as a ping failure.
    pub fn expire_probe_if_overdue(&mut self, now: Instant, deadline: Duration) {
        let overdue = self
            .health
            .test_in_flight
            .is_some_and(|p| now.saturating_duration_since(p.sent_at) > deadline);
        if overdue {
            self.health.test_in_flight = None;
            self.health.consecutive_ping_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::TrafficProfile;
    use std::net::{IpAddr, Ipv4Addr};

    struct NullSink;
    impl SessionSink for NullSink {
        fn send_binary(&self, _frame: Bytes) -> Result<(), SessionSinkError> {
            Ok(())
        }
        fn send_control(&self, _frame: &ControlFrame) -> Result<(), SessionSinkError> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    fn make_session(now: Instant) -> TrafficSession {
        TrafficSession::new(
            Uuid::new_v4(),
            UserArchetype::Gamer,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            TrafficProfile::gamer(),
            Arc::new(NullSink),
            now,
        )
    }

    #[test]
    fn fresh_session_is_active_and_not_terminal() {
        let s = make_session(Instant::now());
        assert!(s.is_active());
        assert!(!s.is_terminal());
    }

    #[test]
    fn inactivity_timeout_marks_terminal() {
        let t0 = Instant::now();
        let mut s = make_session(t0);
        let cfg = SessionConfig::default();
        let reason = s.check_invariants(t0 + cfg.inactivity_timeout + Duration::from_millis(1), &cfg);
        assert_eq!(reason, Some(TerminationReason::Inactive));
        assert!(s.is_terminal());
    }

    #[test]
    fn max_duration_marks_terminal_before_inactivity_if_reached_first() {
        let t0 = Instant::now();
        let mut s = make_session(t0);
        let cfg = SessionConfig::default();
        s.touch(t0 + Duration::from_secs(1));
        let reason = s.check_invariants(t0 + cfg.max_session_duration + Duration::from_millis(1), &cfg);
        assert_eq!(reason, Some(TerminationReason::Expired));
    }

    #[test]
    fn terminal_session_stays_terminal() {
        let t0 = Instant::now();
        let mut s = make_session(t0);
        s.mark_terminal(TerminationReason::Closed);
        s.mark_terminal(TerminationReason::SendError);
        assert_eq!(s.status(), SessionStatus::Terminal(TerminationReason::Closed));
    }

    #[test]
    fn probe_reconciliation_by_id_not_time() {
        let t0 = Instant::now();
        let mut s = make_session(t0);
        s.record_probe_sent(1, t0);
        s.record_probe_sent(2, t0 + Duration::from_millis(500));
        assert!(!s.reconcile_probe_reply(1));
        assert!(s.reconcile_probe_reply(2));
    }

    #[test]
    fn overdue_probe_increments_failure_count() {
        let t0 = Instant::now();
        let mut s = make_session(t0);
        s.record_probe_sent(1, t0);
        s.expire_probe_if_overdue(t0 + Duration::from_millis(1001), Duration::from_secs(1));
        assert_eq!(s.health.consecutive_ping_failures, 1);
        assert!(s.health.test_in_flight.is_none());
    }

    #[test]
    fn three_consecutive_ping_failures_trip_unreachable() {
        let t0 = Instant::now();
        let mut s = make_session(t0);
        let cfg = SessionConfig::default();
        s.health.consecutive_ping_failures = cfg.max_ping_failures + 1;
        let reason = s.check_invariants(t0, &cfg);
        assert_eq!(reason, Some(TerminationReason::Unreachable));
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut s = make_session(Instant::now());
        assert_eq!(s.next_seq(), 0);
        assert_eq!(s.next_seq(), 1);
        assert_eq!(s.next_seq(), 2);
    }
}
