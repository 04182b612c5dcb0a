#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(missing_docs, clippy::doc_markdown, clippy::missing_errors_doc)]

//! Core traffic-generation and measurement engine for the bufferbloat / SQM
//! validation server.
//!
//! This crate has no binary of its own. It is shared by the
//! `netprobe-supervisor` (single-user endpoints, process supervision) and
//! `netprobe-userproc` (per-archetype virtual-household traffic) binaries,
//! and its wire-protocol types are reused by `netprobe-client`.

pub mod archetype;
pub mod burst;
pub mod config;
pub mod errors;
pub mod logging;
pub mod net;
pub mod notify;
pub mod prng;
pub mod profiles;
pub mod protocol;
pub mod ratelimit;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod stats;
pub mod telemetry;
pub mod util;
pub mod warmup;
pub mod watchdog;

/// Common imports for binaries built on top of this crate.
pub mod prelude {
    pub use crate::archetype::UserArchetype;
    pub use crate::config::AppConfig;
    pub use crate::errors::IoError;
    pub use crate::profiles::TrafficProfile;
    pub use crate::protocol::{ControlFrame, FrameHeader, WireDirection, WireKind};
    pub use crate::session::{TerminationReason, TrafficSession};
    pub use crate::telemetry::{LoggingSink, TelemetryError, TelemetrySink, TestRecord};
}
