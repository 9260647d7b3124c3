use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ActorId;

/// Workload view of one actor, supplied by the workload source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub actor_id: ActorId,
    pub name: String,
    /// Current load, `0..=max_workload`.
    pub current_workload: f64,
    /// Load at which the actor is considered full.
    #[serde(default = "default_max_workload")]
    pub max_workload: f64,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub active_task_count: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_max_workload() -> f64 {
    100.0
}

fn default_active() -> bool {
    true
}

impl TeamMember {
    #[must_use]
    pub fn new(actor_id: impl Into<ActorId>, name: impl Into<String>, current_workload: f64) -> Self {
        Self {
            actor_id: actor_id.into(),
            name: name.into(),
            current_workload,
            max_workload: default_max_workload(),
            skills: Vec::new(),
            active_task_count: 0,
            active: true,
        }
    }

    #[must_use]
    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.skills = skills.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Spare capacity, `max_workload - current_workload`.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.max_workload - self.current_workload
    }
}

/// Urgency of a work item, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// A unit of work owned by an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub owner_id: ActorId,
    pub priority: WorkPriority,
    /// Completion ratio, `0.0..=1.0`.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub required_skills: Vec<String>,
}

impl WorkItem {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        owner_id: impl Into<ActorId>,
        priority: WorkPriority,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            owner_id: owner_id.into(),
            priority,
            progress: 0.0,
            due_at: None,
            required_skills: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    #[must_use]
    pub fn with_required_skills(mut self, skills: &[&str]) -> Self {
        self.required_skills = skills.iter().map(|s| (*s).to_owned()).collect();
        self
    }
}

/// Workload figures for one actor after a recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub actor_id: ActorId,
    pub workload_score: f64,
    pub burnout_risk: f64,
    pub active_task_count: u32,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_headroom() {
        let member = TeamMember::new("u1", "Dana", 65.0);
        assert!((member.capacity() - 35.0).abs() < f64::EPSILON);
    }
}
