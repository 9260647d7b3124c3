use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionId, ActorId, OrganizationId};

/// Closed set of remediation action kinds the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Re-run a failed job, integration sync, or stuck process step.
    Retry,
    /// Move pending work from an overloaded actor to others.
    Redistribute,
    /// Send a notification to a set of actors.
    Notify,
}

impl ActionType {
    /// Stable string tag used in audit entries and state keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Redistribute => "redistribute",
            Self::Notify => "notify",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific configuration for an [`AutomatedAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Retry(RetryConfig),
    Redistribute(RedistributeConfig),
    Notify(NotifyConfig),
}

impl ActionConfig {
    /// The action type this configuration belongs to.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Retry(_) => ActionType::Retry,
            Self::Redistribute(_) => ActionType::Redistribute,
            Self::Notify(_) => ActionType::Notify,
        }
    }

    /// Affected-entity type the action's target is resolved from, if any.
    #[must_use]
    pub fn target_entity_type(&self) -> Option<&'static str> {
        match self {
            Self::Retry(cfg) => cfg.target_type.map(RetryTargetType::as_str),
            Self::Redistribute(_) => Some("user"),
            Self::Notify(_) => None,
        }
    }

    /// Whether the trigger context must name a target for the action to run.
    #[must_use]
    pub fn requires_target(&self) -> bool {
        match self {
            Self::Retry(_) => true,
            Self::Redistribute(cfg) => cfg.source_actor_id.is_none(),
            Self::Notify(_) => false,
        }
    }
}

/// Kind of entity a retry action re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTargetType {
    Job,
    Integration,
    ProcessStep,
}

impl RetryTargetType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Integration => "integration",
            Self::ProcessStep => "process_step",
        }
    }
}

/// Configuration for the retry action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// What kind of entity is retried. Required.
    #[serde(default)]
    pub target_type: Option<RetryTargetType>,
    /// Maximum attempts per target, `1..=10`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in seconds, at least 1.
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,
    /// Factor applied to the delay on each successive attempt, at least 1.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_seconds() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            target_type: None,
            max_attempts: default_max_attempts(),
            delay_seconds: default_delay_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Where the redistribute action looks for receiving actors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetPool {
    /// An explicit list of actors.
    Actors { ids: Vec<ActorId> },
    /// Every member of a team.
    Team { team_id: String },
    /// Every member of a department.
    Department { department: String },
}

/// How work items are matched to receiving actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    LeastLoaded,
    SkillBased,
}

/// Configuration for the redistribute action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedistributeConfig {
    pub target_pool: TargetPool,
    #[serde(default = "default_strategy")]
    pub strategy: AssignmentStrategy,
    /// Upper bound on items moved in one execution.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Actors that must never receive work.
    #[serde(default)]
    pub exclude_actor_ids: Vec<ActorId>,
    /// Overrides the source actor resolved from the trigger context.
    #[serde(default)]
    pub source_actor_id: Option<ActorId>,
    /// Notify the source and receiving actors.
    #[serde(default = "default_true")]
    pub notify: bool,
    /// Append a reassignment entry to each item's history.
    #[serde(default = "default_true")]
    pub record_history: bool,
}

fn default_strategy() -> AssignmentStrategy {
    AssignmentStrategy::LeastLoaded
}

fn default_max_items() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Configuration for the notify action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Explicit recipients.
    #[serde(default)]
    pub recipients: Vec<ActorId>,
    /// Also notify every `user` entity affected by the triggering pattern.
    #[serde(default)]
    pub notify_affected: bool,
    pub title: String,
    pub message: String,
}

/// Operator-defined remediation action.
///
/// The engine only reads actions; it never edits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomatedAction {
    pub id: ActionId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub action_type: ActionType,
    pub config: ActionConfig,
    #[serde(default)]
    pub requires_approval: bool,
    /// Roles allowed to approve executions of this action. Empty means the
    /// approval policy's default roles apply.
    #[serde(default)]
    pub approver_roles: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Attempts allowed when a handler reports a retryable execution error.
    #[serde(default = "default_action_attempts")]
    pub max_attempts: u32,
    /// Pattern type this action remediates, if bound to one.
    #[serde(default)]
    pub pattern_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_action_attempts() -> u32 {
    1
}

impl AutomatedAction {
    /// Create an enabled action that runs without approval.
    #[must_use]
    pub fn new(
        id: impl Into<ActionId>,
        organization_id: impl Into<OrganizationId>,
        name: impl Into<String>,
        config: ActionConfig,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            name: name.into(),
            action_type: config.action_type(),
            config,
            requires_approval: false,
            approver_roles: Vec::new(),
            enabled: true,
            max_attempts: default_action_attempts(),
            pattern_type: None,
            created_at: Utc::now(),
        }
    }

    /// Require human approval before execution.
    #[must_use]
    pub fn with_approval(mut self, roles: Vec<String>) -> Self {
        self.requires_approval = true;
        self.approver_roles = roles;
        self
    }

    /// Allow retryable handler errors to be re-attempted.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Bind the action to a pattern type.
    #[must_use]
    pub fn with_pattern_type(mut self, pattern_type: impl Into<String>) -> Self {
        self.pattern_type = Some(pattern_type.into());
        self
    }
}
