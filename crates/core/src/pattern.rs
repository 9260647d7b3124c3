use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::ActionType;

/// Severity of a detected pattern, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity touched by a detected pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedEntity {
    /// Entity kind, e.g. `user`, `job`, `process_step`.
    pub entity_type: String,
    pub id: String,
    pub name: String,
    /// How strongly the pattern affects this entity, `0.0..=1.0`.
    #[serde(default)]
    pub impact: f64,
}

impl AffectedEntity {
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        impact: f64,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            name: name.into(),
            impact,
        }
    }
}

/// A remediation a detector recommends for its pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action_type: ActionType,
    pub description: String,
}

/// Structured anomaly report produced by a detector run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_type: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub affected_entities: Vec<AffectedEntity>,
    #[serde(default)]
    pub suggested_actions: Vec<SuggestedAction>,
    /// How many times the condition was observed in the detection window.
    #[serde(default = "default_occurrences")]
    pub occurrences: u32,
    pub detected_at: DateTime<Utc>,
}

fn default_occurrences() -> u32 {
    1
}

impl DetectedPattern {
    #[must_use]
    pub fn new(
        pattern_type: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            pattern_type: pattern_type.into(),
            description: description.into(),
            severity,
            affected_entities: Vec::new(),
            suggested_actions: Vec::new(),
            occurrences: default_occurrences(),
            detected_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity: AffectedEntity) -> Self {
        self.affected_entities.push(entity);
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, action_type: ActionType, description: impl Into<String>) -> Self {
        self.suggested_actions.push(SuggestedAction {
            action_type,
            description: description.into(),
        });
        self
    }

    #[must_use]
    pub fn with_occurrences(mut self, occurrences: u32) -> Self {
        self.occurrences = occurrences;
        self
    }

    /// The first affected entity of the given type, if any.
    #[must_use]
    pub fn first_entity_of(&self, entity_type: &str) -> Option<&AffectedEntity> {
        self.affected_entities
            .iter()
            .find(|e| e.entity_type == entity_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_seriousness() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn first_entity_of_filters_by_type() {
        let pattern = DetectedPattern::new("overloaded_worker", "too much work", Severity::High)
            .with_entity(AffectedEntity::new("team", "t1", "Platform", 0.4))
            .with_entity(AffectedEntity::new("user", "u1", "Dana", 0.9));
        assert_eq!(pattern.first_entity_of("user").unwrap().id, "u1");
        assert!(pattern.first_entity_of("job").is_none());
    }
}
