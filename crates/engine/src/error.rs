use mender_core::{ApprovalId, ApprovalStatus, ExecutionId, ExecutionStatus};
use thiserror::Error;

/// A decision was attempted on a request that can no longer take one.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("approval request {id} already {status}")]
    AlreadyDecided { id: ApprovalId, status: ApprovalStatus },

    #[error("approval request {0} has expired")]
    Expired(ApprovalId),

    #[error("approval request {0} is already escalated")]
    AlreadyEscalated(ApprovalId),
}

/// Errors returned by the remediation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The action's configuration was rejected. No execution was created.
    #[error("validation error: {0}")]
    Validation(String),

    /// The trigger named no entity for an action that needs one.
    #[error("target resolution error: {0}")]
    TargetResolution(String),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Another execution already holds the `(action, target)` claim.
    #[error("conflict: action {action_id} already has an active execution for target {target_id}")]
    Conflict { action_id: String, target_id: String },

    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Writing the audit trail failed; the audited operation did not complete.
    #[error("audit error: {0}")]
    Audit(#[from] mender_audit::AuditError),

    #[error("state error: {0}")]
    State(#[from] mender_state::StateError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::State(mender_state::StateError::from(err))
    }
}
