//! Aggregate counters exposed by each user process's `/stats` endpoint and
//! the client's periodic `stats` control frames.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::session::TerminationReason;

/// A point-in-time snapshot of a user process's traffic counters.
///
/// Counters are cumulative since process start; a consumer wanting a rate
/// diffs two snapshots itself, same as the teacher's other process-level
/// counters.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct StatsSnapshot {
    /// Sessions currently active (not yet terminal).
    pub active_sessions: usize,
    /// Sessions terminated so far, grouped by reason.
    pub terminated_by_reason: HashMap<TerminationReason, u64>,
    /// Cumulative download bytes sent to clients.
    pub bytes_down_total: u64,
    /// Cumulative upload bytes received from clients.
    pub bytes_up_total: u64,
    /// Cumulative upload bytes requested of clients (for shortfall
    /// accounting: `bytes_up_total` vs. this).
    pub bytes_up_requested_total: u64,
    /// Number of scheduler ticks that exceeded the slow-tick threshold since
    /// process start.
    pub slow_tick_count: u64,
    /// Current consecutive slow-tick streak (resets to zero on any on-budget
    /// tick), exposed so an operator can see how close the process is to a
    /// cap reduction without waiting for it to actually trip.
    pub slow_tick_streak: u32,
}

impl StatsSnapshot {
    /// Record one session termination with `reason`.
    pub fn record_termination(&mut self, reason: TerminationReason) {
        *self.terminated_by_reason.entry(reason).or_insert(0) += 1;
    }

    /// Total sessions ever terminated, across all reasons.
    #[must_use]
    pub fn total_terminated(&self) -> u64 {
        self.terminated_by_reason.values().sum()
    }

    /// Upload shortfall so far: bytes requested of clients but never
    /// received. Never negative by construction, since requested is always
    /// recorded before the corresponding bytes can arrive.
    #[must_use]
    pub fn upload_shortfall(&self) -> u64 {
        self.bytes_up_requested_total
            .saturating_sub(self.bytes_up_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_termination_groups_by_reason() {
        let mut stats = StatsSnapshot::default();
        stats.record_termination(TerminationReason::Inactive);
        stats.record_termination(TerminationReason::Inactive);
        stats.record_termination(TerminationReason::Expired);
        assert_eq!(stats.terminated_by_reason[&TerminationReason::Inactive], 2);
        assert_eq!(stats.terminated_by_reason[&TerminationReason::Expired], 1);
        assert_eq!(stats.total_terminated(), 3);
    }

    #[test]
    fn upload_shortfall_is_the_gap_between_requested_and_received() {
        let mut stats = StatsSnapshot::default();
        stats.bytes_up_requested_total = 1000;
        stats.bytes_up_total = 400;
        assert_eq!(stats.upload_shortfall(), 600);
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let stats = StatsSnapshot::default();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"active_sessions\""));
        assert!(json.contains("\"bytes_down_total\""));
    }
}
