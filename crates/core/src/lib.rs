pub mod action;
pub mod approval;
pub mod execution;
pub mod notification;
pub mod page;
pub mod pattern;
pub mod retry;
pub mod types;
pub mod workload;

pub use action::{
    ActionConfig, ActionType, AssignmentStrategy, AutomatedAction, NotifyConfig,
    RedistributeConfig, RetryConfig, RetryTargetType, TargetPool,
};
pub use approval::{
    ApprovalDecision, ApprovalPolicy, ApprovalPriority, ApprovalQuery, ApprovalRequest,
    ApprovalStatus, Decision, RiskLevel,
};
pub use execution::{
    ActionExecution, EntityChange, ExecutionMetrics, ExecutionQuery, ExecutionStatus,
    TriggerContext,
};
pub use notification::{Notification, NotificationKind};
pub use page::{Page, effective_limit};
pub use pattern::{AffectedEntity, DetectedPattern, Severity, SuggestedAction};
pub use retry::{RetryState, retry_key};
pub use types::{ActionId, ActorId, ApprovalId, ExecutionId, OrganizationId};
pub use workload::{TeamMember, WorkItem, WorkPriority, WorkloadSnapshot};
