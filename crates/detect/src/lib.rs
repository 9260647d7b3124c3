//! Workload scoring and anomaly detection.
//!
//! Detectors read a [`SignalSource`] and emit [`DetectedPattern`]s that
//! callers feed to the remediation engine as trigger context.
//!
//! [`DetectedPattern`]: mender_core::DetectedPattern

pub mod analyzer;
pub mod detector;
pub mod detectors;
pub mod error;
pub mod registry;
pub mod signals;

pub use analyzer::{ActivityCounters, burnout_risk, severity_for_score, snapshot, workload_score};
pub use detector::PatternDetector;
pub use detectors::{ApprovalBottleneckDetector, OverloadedWorkerDetector, StuckWorkflowDetector};
pub use error::DetectError;
pub use registry::DetectorRegistry;
pub use signals::{
    ActorActivity, ApproverBacklog, MemorySignalSource, SignalSource, StalledStep,
};
