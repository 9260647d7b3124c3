use serde::{Deserialize, Serialize};

use crate::types::{ActorId, OrganizationId};

/// Kind of notification, used by delivery channels for routing and templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequested,
    ApprovalEscalated,
    ApprovalExpired,
    ApprovalRejected,
    ExecutionFailed,
    RollbackFailed,
    WorkReassigned,
    WorkReverted,
    Remediation,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalEscalated => "approval_escalated",
            Self::ApprovalExpired => "approval_expired",
            Self::ApprovalRejected => "approval_rejected",
            Self::ExecutionFailed => "execution_failed",
            Self::RollbackFailed => "rollback_failed",
            Self::WorkReassigned => "work_reassigned",
            Self::WorkReverted => "work_reverted",
            Self::Remediation => "remediation",
        }
    }
}

/// A message for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub organization_id: OrganizationId,
    pub recipient_id: ActorId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Notification {
    #[must_use]
    pub fn new(
        organization_id: impl Into<OrganizationId>,
        recipient_id: impl Into<ActorId>,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            recipient_id: recipient_id.into(),
            kind,
            title: title.into(),
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
