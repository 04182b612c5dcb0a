//! Library surface for the standalone sweep/household client (component C8).
//!
//! This crate is deliberately thin: it has no server-side state of its own
//! and exists only to drive a supervisor+userproc fleet from the outside,
//! either as a CLI smoke-test tool ([`main`](../bin/netprobe-client) or as
//! the harness this crate's own integration tests run against a live
//! deployment.

pub mod errors;
pub mod household;
pub mod measurement;
pub mod sweep;
pub mod transport;

pub use errors::ClientError;
pub use household::HouseholdOrchestrator;
pub use measurement::{ArchetypeThroughput, CurrentMeasurement, PingStats, SweepPhase, ThroughputEvent};
pub use sweep::{SingleUserSweep, SweepConfig, UploadTier};
