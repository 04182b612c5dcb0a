//! Session manager + background traffic loop (component C3) — the tightest
//! piece of the design.
//!
//! A single [`SessionManager`] owns every [`TrafficSession`] for one
//! archetype's user process and runs exactly one background tick loop
//! (never spawned sub-tasks for cleanup/validation/traffic) so the ordering
//! guarantees in the spec ("cleanup strictly precedes traffic within a
//! tick") hold by construction rather than by locking discipline.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    burst,
    config::SessionConfig,
    prng::PayloadPool,
    profiles::PacketEnvelope,
    protocol::{ControlFrame, FrameHeader, WireDirection, WireKind},
    session::{SessionSink, SessionSinkError, TerminationReason, TrafficSession},
    stats::StatsSnapshot,
};

/// Synchronously-computed per-session work for one tick's traffic step,
/// carrying a cloned sink handle so the actual paced sends in
/// [`SessionManager::traffic_step`] never touch the session map's lock.
struct TrafficPlan {
    id: Uuid,
    sink: Arc<dyn SessionSink>,
    down_bytes: usize,
    up_bytes: usize,
    envelope: Option<PacketEnvelope>,
    activity_type: crate::profiles::ActivityType,
}

/// Why [`SessionManager::register`] refused to admit a new session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AdmissionError {
    /// The process is already at (possibly slow-tick-reduced) capacity.
    AtCapacity,
}

/// Owns every session for one archetype's user process, plus the single
/// background tick task that drives cleanup, health validation, and traffic
/// generation for all of them.
pub struct SessionManager {
    config: SessionConfig,
    sessions: DashMap<Uuid, TrafficSession>,
    pool: Arc<PayloadPool>,
    stats: parking_lot::Mutex<StatsSnapshot>,
    next_probe_id: AtomicU64,
    /// Effective per-process cap, possibly reduced below `config.per_process_cap`
    /// by sustained slow-tick pressure. Stored separately from the static
    /// config so it can recover independently.
    effective_cap: AtomicUsize,
    slow_tick_streak: AtomicU32,
    on_budget_streak: AtomicU32,
    process_start: Instant,
}

impl SessionManager {
    /// Build a new, empty session manager governed by `config`.
    #[must_use]
    pub fn new(config: SessionConfig, pool: Arc<PayloadPool>) -> Self {
        let cap = config.per_process_cap;
        Self {
            config,
            sessions: DashMap::new(),
            pool,
            stats: parking_lot::Mutex::new(StatsSnapshot::default()),
            next_probe_id: AtomicU64::new(0),
            effective_cap: AtomicUsize::new(cap),
            slow_tick_streak: AtomicU32::new(0),
            on_budget_streak: AtomicU32::new(0),
            process_start: Instant::now(),
        }
    }

    /// Current tunables.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of sessions currently tracked (active or not yet reaped).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current effective admission cap, possibly below `config.per_process_cap`
    /// under sustained slow-tick pressure.
    #[must_use]
    pub fn effective_cap(&self) -> usize {
        self.effective_cap.load(Ordering::Relaxed)
    }

    /// Point-in-time counter snapshot, for `/stats`.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.lock().clone()
    }

    /// Wall-clock uptime since this manager was constructed.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.process_start.elapsed()
    }

    /// Admit a new session, subject to the effective per-process capacity.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::AtCapacity`] if the process is already at
    /// its (possibly slow-tick-reduced) session cap; the caller should close
    /// the WS upgrade rather than register the session.
    pub fn register(&self, session: TrafficSession) -> Result<(), AdmissionError> {
        if self.sessions.len() >= self.effective_cap() {
            return Err(AdmissionError::AtCapacity);
        }
        self.sessions.insert(session.session_id, session);
        Ok(())
    }

    /// Record inbound activity (any frame, including a control reply) for
    /// `session_id`, resetting its inactivity clock.
    pub fn touch(&self, session_id: Uuid, now: Instant) {
        if let Some(mut s) = self.sessions.get_mut(&session_id) {
            s.touch(now);
        }
    }

    /// Reconcile a `connection_test_reply` for `session_id`.
    pub fn reconcile_probe_reply(&self, session_id: Uuid, probe_id: u64, now: Instant) {
        if let Some(mut s) = self.sessions.get_mut(&session_id) {
            if s.reconcile_probe_reply(probe_id) {
                s.touch(now);
            }
        }
    }

    /// Record `bytes` of upload payload actually received for `session_id`.
    pub fn record_upload_received(&self, session_id: Uuid, bytes: u64, now: Instant) {
        if let Some(mut s) = self.sessions.get_mut(&session_id) {
            s.bytes_received_up += bytes;
            s.touch(now);
        }
        self.stats.lock().bytes_up_total += bytes;
    }

    /// Mark `session_id` terminal immediately (e.g. on WS close detected by
    /// the connection's read task), outside the regular tick cadence.
    pub fn mark_closed(&self, session_id: Uuid) {
        if let Some(mut s) = self.sessions.get_mut(&session_id) {
            s.mark_terminal(TerminationReason::Closed);
        }
    }

    /// Mark `session_id` terminal with an arbitrary `reason`, outside the
    /// regular tick cadence — used by the connection's read task for reasons
    /// [`Self::mark_closed`] doesn't cover, e.g. a malformed inbound frame
    /// (`TerminationReason::ProtocolViolation`).
    pub fn terminate(&self, session_id: Uuid, reason: TerminationReason) {
        self.terminate_with(session_id, reason);
    }

    /// Run the background tick loop forever. Intended to be the single task
    /// spawned for this manager at process boot.
    pub async fn run(self: Arc<Self>) {
        let span = trace_span!("session_manager_tick_loop");
        async move {
            let mut timer = tokio::time::interval(self.config.tick_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let tick_start = Instant::now();
                self.tick(tick_start).await;
                self.record_tick_duration(tick_start.elapsed());
            }
        }
        .instrument(span)
        .await;
    }

    /// Run exactly one tick: cleanup, then active validation, then traffic,
    /// then upload requests. Exposed standalone (rather than only via
    /// [`Self::run`]) so tests can drive individual ticks deterministically.
    pub async fn tick(&self, now: Instant) {
        self.cleanup_first(now);
        self.active_validation(now).await;
        self.traffic_step(now).await;
    }

    /// Step 1: evaluate I2/I3/I4 against every session and reap any that are
    /// already terminal or newly tripped. Runs before any traffic generation
    /// on every tick (P1: cleanup precedence) — a session removed this tick
    /// emits zero bytes this tick because it is no longer in `self.sessions`
    /// by the time [`Self::traffic_step`] iterates it.
    fn cleanup_first(&self, now: Instant) {
        let mut terminal_ids = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.is_terminal() {
                terminal_ids.push((session.session_id, session.status()));
                continue;
            }
            if let Some(reason) = session.check_invariants(now, &self.config) {
                terminal_ids.push((session.session_id, crate::session::SessionStatus::Terminal(reason)));
            }
        }
        for (id, status) in terminal_ids {
            self.sessions.remove(&id);
            if let crate::session::SessionStatus::Terminal(reason) = status {
                self.stats.lock().record_termination(reason);
                trace!(session_id = %id, ?reason, "session reaped");
            }
        }
    }

    /// Step 2: for every remaining session, check the connection's observed
    /// open state and liveness-probe health.
    async fn active_validation(&self, now: Instant) {
        let mut newly_terminal = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if !session.sink.is_open() {
                session.mark_terminal(TerminationReason::Closed);
                newly_terminal.push(session.session_id);
                continue;
            }
            session.expire_probe_if_overdue(now, self.config.probe_deadline);
            if let Some(reason) = session.check_invariants(now, &self.config) {
                newly_terminal.push(session.session_id);
                let _ = reason;
                continue;
            }
            if session.needs_probe(now, self.config.probe_threshold) {
                let probe_id = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
                let frame = ControlFrame::ConnectionTest { probe_id };
                if session.sink.send_control(&frame).is_ok() {
                    session.record_probe_sent(probe_id, now);
                } else {
                    session.mark_terminal(TerminationReason::SendError);
                    newly_terminal.push(session.session_id);
                }
            }
        }
        for id in newly_terminal {
            if let Some((_, session)) = self.sessions.remove(&id) {
                if let crate::session::SessionStatus::Terminal(reason) = session.status() {
                    self.stats.lock().record_termination(reason);
                }
            }
        }
    }

    /// Step 3 + 4: compute each surviving session's current effective rate,
    /// emit shaped download traffic, and (if the profile calls for it)
    /// request upload traffic — all for sessions validated earlier in this
    /// same tick, never for ones reaped in steps 1/2.
    ///
    /// Two phases, deliberately: phase one walks the session map and does
    /// only synchronous work (burst evaluation, cloning out an `Arc`-backed
    /// sink handle), so no map entry's lock is ever held across an `.await`.
    /// Phase two — the actual paced sends, which do sleep between packets
    /// for real-time envelopes — runs entirely off that cloned plan, touching
    /// the map again only for brief, synchronous per-packet bookkeeping.
    /// Holding a `DashMap` entry guard across a sleep would, on this
    /// process's single-threaded runtime, let one session's pacing delay
    /// block every other task on the same shard, including the WS read task
    /// racing to touch that same session — a self-inflicted stall indistinguishable
    /// from a wedged tick loop.
    async fn traffic_step(&self, now: Instant) {
        let tick_dt = self.config.tick_interval;
        let mut plans = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.is_terminal() {
                continue;
            }
            let (down_mbps, up_mbps, new_burst_state) =
                burst::evaluate(&session.profile, session.burst_state, now);
            session.burst_state = new_burst_state;
            plans.push(TrafficPlan {
                id: session.session_id,
                sink: session.sink.clone(),
                down_bytes: mbps_to_bytes(down_mbps, tick_dt),
                up_bytes: if up_mbps > 0.0 { mbps_to_bytes(up_mbps, tick_dt) } else { 0 },
                envelope: session.profile.packet_envelope,
                activity_type: session.profile.activity_type,
            });
        }
        // Every map guard from the loop above is dropped by this point.

        let mut bytes_down_delta = 0u64;
        let mut bytes_up_requested_delta = 0u64;
        for plan in plans {
            let down_result = if plan.down_bytes == 0 {
                Ok(0)
            } else if let Some(envelope) = plan.envelope {
                self.emit_shaped_download(plan.id, &plan.sink, &envelope, plan.activity_type, plan.down_bytes, tick_dt, now)
                    .await
            } else {
                self.emit_bulk_download(plan.id, &plan.sink, plan.down_bytes, now)
            };
            let sent = match down_result {
                Ok(sent) => sent,
                Err(()) => {
                    self.terminate_with(plan.id, TerminationReason::SendError);
                    continue;
                }
            };
            bytes_down_delta += sent;

            if plan.up_bytes > 0 {
                match self.send_upload_request(plan.id, &plan.sink, plan.up_bytes, tick_dt) {
                    Ok(()) => bytes_up_requested_delta += plan.up_bytes as u64,
                    Err(()) => self.terminate_with(plan.id, TerminationReason::SendError),
                }
            }
        }

        if bytes_down_delta > 0 || bytes_up_requested_delta > 0 {
            let mut stats = self.stats.lock();
            stats.bytes_down_total += bytes_down_delta;
            stats.bytes_up_requested_total += bytes_up_requested_delta;
        }
    }

    /// Allocate the next sequence number for `id` and touch its activity
    /// clock, via a brief synchronous map lock that is never held across an
    /// `.await`. Returns `None` if the session vanished (already reaped)
    /// since the plan was built.
    fn reserve_seq(&self, id: Uuid, now: Instant) -> Option<u32> {
        let mut entry = self.sessions.get_mut(&id)?;
        let seq = entry.next_seq();
        entry.touch(now);
        Some(seq)
    }

    /// Add `bytes` to a session's cumulative download counter.
    fn add_bytes_down(&self, id: Uuid, bytes: u64) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.bytes_sent_down += bytes;
        }
    }

    /// Mark `id` terminal with `reason`, if it still exists. Actual removal
    /// from the map happens on the next tick's cleanup step (step 1), which
    /// keeps this a brief, lock-only operation here.
    fn terminate_with(&self, id: Uuid, reason: TerminationReason) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.mark_terminal(reason);
        }
    }

    /// Send a `request_upload` control frame and record the requested byte
    /// count against the session, entirely synchronously.
    fn send_upload_request(
        &self,
        id: Uuid,
        sink: &Arc<dyn SessionSink>,
        up_bytes: usize,
        tick_dt: Duration,
    ) -> Result<(), ()> {
        let Some(seq) = self.reserve_seq(id, Instant::now()) else { return Ok(()) };
        let frame = ControlFrame::RequestUpload {
            seq,
            bytes: up_bytes as u64,
            deadline_ms: (tick_dt.as_millis() as u32).saturating_mul(2),
        };
        if sink.send_control(&frame).is_err() {
            return Err(());
        }
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.bytes_requested_up += up_bytes as u64;
        }
        Ok(())
    }

    /// Emit `total_bytes` of download payload as individually-paced packets
    /// sized within `envelope`'s `[min_bytes, max_bytes]` range, spaced by
    /// `envelope.send_interval_ms` plus deterministic per-archetype jitter,
    /// so adjacent shapers' bulk-detectors never see them as one stream.
    ///
    /// Any packet count this tick can't finish within the tick budget rolls
    /// into the next tick rather than being dropped, which is what keeps P3
    /// (rate envelope, ±15%) holding over 1-second windows even though a
    /// single tick may over- or under-shoot by a packet or two. No map entry
    /// is held locked while this function sleeps between packets.
    #[allow(clippy::too_many_arguments)]
    async fn emit_shaped_download(
        &self,
        id: Uuid,
        sink: &Arc<dyn SessionSink>,
        envelope: &PacketEnvelope,
        activity_type: crate::profiles::ActivityType,
        total_bytes: usize,
        tick_dt: Duration,
        now: Instant,
    ) -> Result<u64, ()> {
        let avg_packet_size = f64::from(envelope.min_bytes + envelope.max_bytes) / 2.0;
        let packet_count = ((total_bytes as f64) / avg_packet_size).round().max(1.0) as usize;
        let jitter_ms = jitter_bound_ms(activity_type);
        let budget_deadline = Instant::now() + tick_dt;
        let mut seed = id.as_u128() as u64 ^ now.elapsed().as_nanos() as u64;

        let mut sent = 0u64;
        for i in 0..packet_count {
            if Instant::now() >= budget_deadline {
                // Roll the remainder into the next tick rather than stall
                // this tick's budget; the bytes already sent still count
                // toward this tick's accounting.
                break;
            }
            let size = envelope_packet_size(envelope, &mut seed);
            let Some(seq) = self.reserve_seq(id, Instant::now()) else { break };
            let send_ts = crate::util::now_unix_ms() as u32;
            let header = FrameHeader {
                seq,
                send_ts,
                direction: WireDirection::Down,
                kind: WireKind::Traffic,
                size: size as u16,
                aux: 0,
            };
            let mut buf = bytes::BytesMut::with_capacity(FrameHeader::len() + size);
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(&self.pool.take(size));
            if sink.send_binary(buf.freeze()).is_err() {
                return Err(());
            }
            self.add_bytes_down(id, size as u64);
            sent += size as u64;

            if i + 1 < packet_count {
                let gap = Duration::from_millis(envelope.send_interval_ms as u64)
                    + jitter_duration(jitter_ms, &mut seed);
                tokio::time::sleep(gap.min(budget_deadline.saturating_duration_since(Instant::now())))
                    .await;
            }
        }
        Ok(sent)
    }

    /// Emit `total_bytes` of download payload as one (or a few, for very
    /// large amounts) large frame(s) — used by archetypes with no packet
    /// envelope (streamer, bulk), where CAKE-style misclassification
    /// avoidance is not a concern and a single efficient write is preferred.
    /// Entirely synchronous: no pacing sleep, so no lock-across-await
    /// concern applies here, but the map is still only ever locked briefly.
    fn emit_bulk_download(
        &self,
        id: Uuid,
        sink: &Arc<dyn SessionSink>,
        total_bytes: usize,
        now: Instant,
    ) -> Result<u64, ()> {
        const MAX_FRAME: usize = u16::MAX as usize;
        let mut remaining = total_bytes;
        let mut sent = 0u64;
        while remaining > 0 {
            let size = remaining.min(MAX_FRAME);
            let Some(seq) = self.reserve_seq(id, now) else { break };
            let send_ts = crate::util::now_unix_ms() as u32;
            let header = FrameHeader {
                seq,
                send_ts,
                direction: WireDirection::Down,
                kind: WireKind::Traffic,
                size: size as u16,
                aux: 0,
            };
            let mut buf = bytes::BytesMut::with_capacity(FrameHeader::len() + size);
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(&self.pool.take(size));
            if sink.send_binary(buf.freeze()).is_err() {
                return Err(());
            }
            self.add_bytes_down(id, size as u64);
            sent += size as u64;
            remaining -= size;
        }
        Ok(sent)
    }

    /// Record a completed tick's wall-clock duration against the slow-tick
    /// canary: persistently slow ticks reduce the effective admission cap
    /// until the process catches up; a sustained run of on-budget ticks
    /// restores it.
    fn record_tick_duration(&self, elapsed: Duration) {
        let threshold = self.config.tick_interval.mul_f64(self.config.slow_tick_factor);
        if elapsed > threshold {
            self.stats.lock().slow_tick_count += 1;
            let streak = self.slow_tick_streak.fetch_add(1, Ordering::Relaxed) + 1;
            self.on_budget_streak.store(0, Ordering::Relaxed);
            self.stats.lock().slow_tick_streak = streak;
            warn!(elapsed_ms = elapsed.as_millis(), threshold_ms = threshold.as_millis(), streak, "slow tick");
            if streak >= self.config.slow_tick_threshold {
                let current = self.effective_cap.load(Ordering::Relaxed);
                let reduced = (current * 3 / 4).max(1);
                if reduced < current {
                    self.effective_cap.store(reduced, Ordering::Relaxed);
                    debug!(from = current, to = reduced, "reduced per-process session cap under slow-tick pressure");
                }
            }
        } else {
            self.slow_tick_streak.store(0, Ordering::Relaxed);
            self.stats.lock().slow_tick_streak = 0;
            let streak = self.on_budget_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= self.config.slow_tick_restore {
                let current = self.effective_cap.load(Ordering::Relaxed);
                if current < self.config.per_process_cap {
                    self.effective_cap.store(self.config.per_process_cap, Ordering::Relaxed);
                    debug!(to = self.config.per_process_cap, "restored per-process session cap");
                }
            }
        }
    }
}

/// Deterministic per-archetype jitter bound, in milliseconds, per §4.3's
/// anti-chunking rule (±2 ms gamer, ±1 ms video_caller; no requirement for
/// archetypes with no packet envelope).
fn jitter_bound_ms(activity_type: crate::profiles::ActivityType) -> u64 {
    use crate::profiles::ActivityType;
    match activity_type {
        ActivityType::RealtimeSmall => 2,
        ActivityType::VideoBidirectional => 1,
        _ => 0,
    }
}

fn jitter_duration(bound_ms: u64, seed: &mut u64) -> Duration {
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    // Cheap splitmix-style step: no crypto RNG on the hot path (§9).
    *seed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    let span = 2 * bound_ms + 1;
    let offset = (*seed >> 33) % span;
    Duration::from_millis(offset).saturating_sub(Duration::from_millis(bound_ms))
}

fn envelope_packet_size(envelope: &PacketEnvelope, seed: &mut u64) -> usize {
    *seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D).wrapping_add(1);
    let span = u32::from(envelope.max_bytes - envelope.min_bytes) + 1;
    let offset = ((*seed >> 32) as u32) % span;
    usize::from(envelope.min_bytes) + offset as usize
}

/// Convert a rate in Mbps and an elapsed duration into a byte count.
fn mbps_to_bytes(mbps: f64, dt: Duration) -> usize {
    if mbps <= 0.0 {
        return 0;
    }
    ((mbps * 1_000_000.0 / 8.0) * dt.as_secs_f64()).round().max(0.0) as usize
}

impl FrameHeader {
    /// Convenience alias for [`crate::protocol::HEADER_LEN`], local to this
    /// module's buffer-sizing arithmetic.
    const fn len() -> usize {
        crate::protocol::HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{archetype::UserArchetype, profiles::TrafficProfile};
    use parking_lot::Mutex as PlMutex;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct RecordingSink {
        open: PlMutex<bool>,
        binary_frames: PlMutex<Vec<bytes::Bytes>>,
        control_frames: PlMutex<Vec<ControlFrame>>,
        fail_sends: PlMutex<bool>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { open: PlMutex::new(true), ..Default::default() })
        }
    }

    impl SessionSink for Arc<RecordingSink> {
        fn send_binary(&self, frame: bytes::Bytes) -> Result<(), SessionSinkError> {
            if *self.fail_sends.lock() {
                return Err(SessionSinkError::Closed);
            }
            self.binary_frames.lock().push(frame);
            Ok(())
        }

        fn send_control(&self, frame: &ControlFrame) -> Result<(), SessionSinkError> {
            if *self.fail_sends.lock() {
                return Err(SessionSinkError::Closed);
            }
            self.control_frames.lock().push(frame.clone());
            Ok(())
        }

        fn is_open(&self) -> bool {
            *self.open.lock()
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(SessionConfig::default(), Arc::new(PayloadPool::new(1)))
    }

    fn insert_session(
        mgr: &SessionManager,
        profile: TrafficProfile,
        now: Instant,
    ) -> (Uuid, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let id = Uuid::new_v4();
        let session = TrafficSession::new(
            id,
            UserArchetype::Gamer,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            profile,
            sink.clone(),
            now,
        );
        mgr.register(session).unwrap();
        (id, sink)
    }

    #[tokio::test]
    async fn cleanup_runs_before_traffic_for_dead_sessions() {
        // P1: a session whose inactivity timeout has already elapsed must
        // emit zero bytes in the tick that reaps it.
        let mgr = manager();
        let t0 = Instant::now();
        let (id, sink) = insert_session(&mgr, TrafficProfile::streamer(), t0);
        let past_timeout = t0 + mgr.config().inactivity_timeout + Duration::from_secs(1);
        mgr.tick(past_timeout).await;
        assert_eq!(mgr.session_count(), 0);
        assert!(sink.binary_frames.lock().is_empty());
        let _ = id;
    }

    #[tokio::test]
    async fn healthy_gamer_session_emits_shaped_packets() {
        let mgr = manager();
        let t0 = Instant::now();
        let (_, sink) = insert_session(&mgr, TrafficProfile::gamer(), t0);
        mgr.tick(t0 + Duration::from_millis(10)).await;
        let frames = sink.binary_frames.lock();
        assert!(!frames.is_empty());
        for frame in frames.iter() {
            let payload_len = frame.len() - crate::protocol::HEADER_LEN;
            assert!((64..=128).contains(&payload_len), "payload_len={payload_len}");
        }
    }

    #[tokio::test]
    async fn send_failure_marks_terminal_same_tick() {
        let mgr = manager();
        let t0 = Instant::now();
        let (_, sink) = insert_session(&mgr, TrafficProfile::streamer(), t0);
        *sink.fail_sends.lock() = true;
        mgr.tick(t0 + Duration::from_millis(10)).await;
        assert_eq!(mgr.session_count(), 0);
        assert_eq!(mgr.stats_snapshot().terminated_by_reason.get(&TerminationReason::SendError), Some(&1));
    }

    #[tokio::test]
    async fn closed_connection_is_reaped_in_active_validation() {
        let mgr = manager();
        let t0 = Instant::now();
        let (_, sink) = insert_session(&mgr, TrafficProfile::gamer(), t0);
        *sink.open.lock() = false;
        mgr.tick(t0 + Duration::from_millis(10)).await;
        assert_eq!(mgr.session_count(), 0);
        assert_eq!(mgr.stats_snapshot().terminated_by_reason.get(&TerminationReason::Closed), Some(&1));
    }

    #[tokio::test]
    async fn admission_respects_effective_cap() {
        let mut cfg = SessionConfig::default();
        cfg.per_process_cap = 1;
        let mgr = SessionManager::new(cfg, Arc::new(PayloadPool::new(1)));
        let t0 = Instant::now();
        insert_session(&mgr, TrafficProfile::gamer(), t0);
        let sink = RecordingSink::new();
        let session = TrafficSession::new(
            Uuid::new_v4(),
            UserArchetype::Gamer,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            TrafficProfile::gamer(),
            sink,
            t0,
        );
        assert_eq!(mgr.register(session), Err(AdmissionError::AtCapacity));
    }

    #[tokio::test]
    async fn upload_request_is_sent_for_video_caller() {
        let mgr = manager();
        let t0 = Instant::now();
        let (_, sink) = insert_session(&mgr, TrafficProfile::video_caller(), t0);
        mgr.tick(t0 + Duration::from_millis(10)).await;
        let controls = sink.control_frames.lock();
        assert!(controls.iter().any(|f| matches!(f, ControlFrame::RequestUpload { .. })));
    }
}
