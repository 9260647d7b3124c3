use chrono::{DateTime, Utc};
use mender_core::EntityChange;

/// What a successful handler run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    /// Summary payload stored on the execution.
    pub result: serde_json::Value,
    /// Domain-level changes for traceability.
    pub changes: Vec<EntityChange>,
    /// Data the handler needs to reverse this run, if it supports rollback.
    pub rollback_data: Option<serde_json::Value>,
}

impl HandlerResult {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_change(mut self, change: EntityChange) -> Self {
        self.changes.push(change);
        self
    }

    #[must_use]
    pub fn with_changes(mut self, changes: Vec<EntityChange>) -> Self {
        self.changes.extend(changes);
        self
    }

    #[must_use]
    pub fn with_rollback_data(mut self, data: serde_json::Value) -> Self {
        self.rollback_data = Some(data);
        self
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The work is done.
    Completed(HandlerResult),
    /// The work must be attempted again no earlier than `not_before`.
    Deferred {
        not_before: DateTime<Utc>,
        reason: String,
        /// `false` when the handler returned without trying, e.g. because a
        /// backoff window was still open. Such runs do not count as attempts.
        attempted: bool,
    },
}

impl HandlerOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self::Completed(HandlerResult::new(result))
    }

    /// An attempt was made and must be repeated later.
    pub fn deferred(not_before: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::Deferred {
            not_before,
            reason: reason.into(),
            attempted: true,
        }
    }

    /// Nothing was tried; come back at `not_before`.
    pub fn waiting(not_before: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::Deferred {
            not_before,
            reason: reason.into(),
            attempted: false,
        }
    }
}
