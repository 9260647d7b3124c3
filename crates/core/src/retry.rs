use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ActionId;

/// Per `(action, target)` retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub action_id: ActionId,
    pub target_id: String,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Backoff that must elapse after `last_attempt_at` before the next attempt.
    pub next_delay_ms: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl RetryState {
    #[must_use]
    pub fn new(action_id: impl Into<ActionId>, target_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            target_id: target_id.into(),
            attempt_count: 0,
            last_attempt_at: None,
            next_delay_ms: 0,
            errors: Vec::new(),
        }
    }

    /// The instant before which no new attempt may start, if any.
    #[must_use]
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        let last = self.last_attempt_at?;
        let delay = i64::try_from(self.next_delay_ms).unwrap_or(i64::MAX);
        last.checked_add_signed(chrono::Duration::milliseconds(delay))
    }

    /// Composite key for this state's `(action, target)` pair.
    #[must_use]
    pub fn key(&self) -> String {
        retry_key(&self.action_id, &self.target_id)
    }
}

/// Render the composite key for an `(action, target)` pair.
///
/// The action id is length-prefixed (`<len>:<action>:<target>`) so ids that
/// contain `:` cannot collide.
#[must_use]
pub fn retry_key(action_id: &ActionId, target_id: &str) -> String {
    format!("{}:{action_id}:{target_id}", action_id.as_str().len())
}
