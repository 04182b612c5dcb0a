//! Local telemetry sink: a narrow seam for recording completed test runs.
//!
//! Anonymized forwarding to a central collector is out of scope; this
//! module only defines the trait and record shape a forwarder would plug
//! into, plus a log-only default so the supervisor always has somewhere to
//! send completed runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::stats::StatsSnapshot;

/// One completed test run, ready to be handed to a [`TelemetrySink`].
///
/// Fields are deliberately coarse (no per-packet detail, no client IP):
/// whatever forwards this further is responsible for any anonymization it
/// needs, but this crate gives it nothing finer-grained to anonymize.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TestRecord {
    /// Identifier correlating this record with the session(s) it summarizes.
    pub test_id: Uuid,
    /// Which kind of test produced this record.
    pub kind: TestKind,
    /// Wall-clock duration of the run, in milliseconds.
    pub duration_ms: u64,
    /// Per-archetype or per-connection counters at the time the run ended.
    pub stats: StatsSnapshot,
    /// Free-form outcome label, e.g. `"completed"`, `"aborted"`, `"timed_out"`.
    pub outcome: String,
}

/// Which scenario produced a [`TestRecord`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// The four-archetype virtual-household scenario.
    VirtualHousehold,
    /// The single-user speed/bufferbloat sweep.
    SingleUserSweep,
}

/// Failure submitting a [`TestRecord`] to a [`TelemetrySink`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    /// The sink's backing store or transport rejected the record.
    #[error("telemetry submission failed: {0}")]
    SubmissionFailed(String),
}

/// Destination for completed [`TestRecord`]s.
///
/// Kept as a trait rather than a concrete type so a deployment can plug in
/// its own forwarder (a webhook, a message queue, a database) without this
/// crate needing to depend on any of those; [`LoggingSink`] is the default
/// and the only implementation this crate ships.
pub trait TelemetrySink: fmt::Debug + Send + Sync {
    /// Submit one completed test run.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError`] if the sink could not accept the record.
    /// Callers are expected to log and continue rather than treat this as
    /// fatal: a telemetry failure must never abort or delay a live test.
    fn submit(&self, record: TestRecord) -> Result<(), TelemetryError>;
}

/// Default [`TelemetrySink`]: logs the record at `info` and drops it.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl TelemetrySink for LoggingSink {
    fn submit(&self, record: TestRecord) -> Result<(), TelemetryError> {
        info!(
            test_id = %record.test_id,
            kind = ?record.kind,
            duration_ms = record.duration_ms,
            outcome = %record.outcome,
            "test run completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TestRecord {
        TestRecord {
            test_id: Uuid::nil(),
            kind: TestKind::VirtualHousehold,
            duration_ms: 1234,
            stats: StatsSnapshot::default(),
            outcome: "completed".to_string(),
        }
    }

    #[test]
    fn logging_sink_never_fails() {
        let sink = LoggingSink;
        assert!(sink.submit(sample_record()).is_ok());
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: TestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
