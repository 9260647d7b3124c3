use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much attention an audit entry deserves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// A single append-only audit entry.
///
/// Entries are never edited or deleted once recorded. Every state transition
/// of an execution or approval request produces at least one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// Dotted event name, e.g. `execution.completed`.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub organization_id: String,
    /// Kind of entity the event concerns (`action_execution`, `approval_request`, ...).
    pub entity_type: String,
    pub entity_id: String,
    /// Human-readable description of what happened.
    pub action: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub severity: AuditSeverity,
    /// Actor responsible for the event, if any.
    #[serde(default)]
    pub actor_id: Option<String>,

    // -- Hash chain --
    /// `SHA-256` hex digest of the canonicalized entry.
    #[serde(default)]
    pub record_hash: Option<String>,
    /// Hash of the previous entry in the same organization's chain.
    #[serde(default)]
    pub previous_hash: Option<String>,
    /// Monotonic sequence number within the organization.
    #[serde(default)]
    pub sequence_number: Option<u64>,
}

impl AuditEntry {
    /// Create an informational entry stamped with the current time.
    pub fn new(
        organization_id: impl Into<String>,
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            organization_id: organization_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: action.into(),
            details: serde_json::Value::Null,
            severity: AuditSeverity::Info,
            actor_id: None,
            record_hash: None,
            previous_hash: None,
            sequence_number: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Result ordering for [`AuditQuery`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOrder {
    /// Most recently recorded first.
    #[default]
    NewestFirst,
    /// Ascending `sequence_number`, for walking a hash chain.
    SequenceAsc,
    /// Descending `sequence_number`, for finding a chain's tip.
    SequenceDesc,
}

/// Query parameters for searching audit entries.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuditQuery {
    pub organization_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub event_type: Option<String>,
    /// Only entries at or above this severity.
    pub min_severity: Option<AuditSeverity>,
    /// Only entries at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only entries at or before this time.
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of entries to return (default 50, max 1000).
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    #[serde(default)]
    pub order: AuditOrder,
}

impl AuditQuery {
    /// Entries for one entity, newest first.
    #[must_use]
    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    /// Return the effective limit, clamped to 1..=1000, defaulting to 50.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(50).clamp(1, 1000)
    }

    #[must_use]
    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Whether `entry` passes every filter set on this query.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        fn eq(filter: Option<&String>, value: &str) -> bool {
            filter.is_none_or(|f| f == value)
        }

        eq(self.organization_id.as_ref(), &entry.organization_id)
            && eq(self.entity_type.as_ref(), &entry.entity_type)
            && eq(self.entity_id.as_ref(), &entry.entity_id)
            && eq(self.event_type.as_ref(), &entry.event_type)
            && self.min_severity.is_none_or(|s| entry.severity >= s)
            && self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp <= to)
    }
}

/// A paginated page of audit entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    /// Total number of entries matching the query (before pagination).
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}
