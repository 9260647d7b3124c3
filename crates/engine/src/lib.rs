//! The remediation engine: action executor core, approval workflow, and
//! periodic sweeps over pluggable state and audit backends.

pub mod approval;
pub mod background;
pub mod builder;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod records;
pub mod trail;

pub use approval::{ApprovalWorkflow, DecisionOutcome, WIDE_IMPACT_ENTITIES, determine_priority};
pub use background::{BackgroundSweeper, SweepConfig, SweepKind, SweepReport};
pub use builder::EngineBuilder;
pub use engine::RemediationEngine;
pub use error::{EngineError, PolicyError};
pub use executor::ActionExecutor;
pub use metrics::{EngineMetrics, MetricsSnapshot};
