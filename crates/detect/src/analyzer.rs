//! Workload and burnout scoring.
//!
//! Everything here is a pure function of [`ActivityCounters`]; scores are
//! normalized to `0.0..=100.0`.

use chrono::{DateTime, Utc};
use mender_core::{ActorId, Severity, WorkloadSnapshot};
use serde::{Deserialize, Serialize};

const TASK_WEIGHT: f64 = 0.5;
const OVERDUE_WEIGHT: f64 = 0.2;
const MEETING_WEIGHT: f64 = 0.2;
const COMMUNICATION_WEIGHT: f64 = 0.1;

/// Meeting hours in the window that count as a full calendar.
const FULL_MEETING_HOURS: f64 = 30.0;
/// Messages in the window that count as saturated communication.
const FULL_MESSAGE_COUNT: f64 = 200.0;
/// After-hours events in the window that count as maximal overtime.
const FULL_AFTER_HOURS_EVENTS: f64 = 20.0;

/// Raw activity for one actor over a detection window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCounters {
    pub open_tasks: u32,
    #[serde(default)]
    pub overdue_tasks: u32,
    /// Tasks the actor can carry at full load.
    #[serde(default = "default_task_capacity")]
    pub task_capacity: u32,
    #[serde(default)]
    pub meeting_hours: f64,
    #[serde(default)]
    pub messages_sent: u32,
    /// Events outside working hours.
    #[serde(default)]
    pub after_hours_events: u32,
}

fn default_task_capacity() -> u32 {
    10
}

impl Default for ActivityCounters {
    fn default() -> Self {
        Self {
            open_tasks: 0,
            overdue_tasks: 0,
            task_capacity: default_task_capacity(),
            meeting_hours: 0.0,
            messages_sent: 0,
            after_hours_events: 0,
        }
    }
}

fn saturate(value: f64, full: f64) -> f64 {
    if full <= 0.0 {
        return 1.0;
    }
    (value / full).clamp(0.0, 1.0)
}

/// Weighted load score: open tasks against capacity, overdue share, meeting
/// time and message volume.
pub fn workload_score(counters: &ActivityCounters) -> f64 {
    let task_load = saturate(
        f64::from(counters.open_tasks),
        f64::from(counters.task_capacity),
    );
    let overdue = if counters.open_tasks == 0 {
        0.0
    } else {
        saturate(f64::from(counters.overdue_tasks), f64::from(counters.open_tasks))
    };
    let meetings = saturate(counters.meeting_hours, FULL_MEETING_HOURS);
    let communication = saturate(f64::from(counters.messages_sent), FULL_MESSAGE_COUNT);

    let score = TASK_WEIGHT * task_load
        + OVERDUE_WEIGHT * overdue
        + MEETING_WEIGHT * meetings
        + COMMUNICATION_WEIGHT * communication;
    (score * 100.0).clamp(0.0, 100.0)
}

/// Burnout risk: the workload score, pushed up by after-hours activity.
pub fn burnout_risk(counters: &ActivityCounters) -> f64 {
    let overtime = saturate(f64::from(counters.after_hours_events), FULL_AFTER_HOURS_EVENTS);
    (0.6 * workload_score(counters) + 40.0 * overtime).clamp(0.0, 100.0)
}

/// Bucket a 0-100 score into a pattern severity.
pub fn severity_for_score(score: f64) -> Severity {
    match score {
        s if s >= 85.0 => Severity::Critical,
        s if s >= 70.0 => Severity::High,
        s if s >= 50.0 => Severity::Medium,
        _ => Severity::Low,
    }
}

pub fn snapshot(
    actor_id: ActorId,
    counters: &ActivityCounters,
    computed_at: DateTime<Utc>,
) -> WorkloadSnapshot {
    WorkloadSnapshot {
        actor_id,
        workload_score: workload_score(counters),
        burnout_risk: burnout_risk(counters),
        active_task_count: counters.open_tasks,
        computed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(open: u32, overdue: u32, meetings: f64, messages: u32, after: u32) -> ActivityCounters {
        ActivityCounters {
            open_tasks: open,
            overdue_tasks: overdue,
            meeting_hours: meetings,
            messages_sent: messages,
            after_hours_events: after,
            ..ActivityCounters::default()
        }
    }

    #[test]
    fn idle_actor_scores_zero() {
        let idle = ActivityCounters::default();
        assert!(workload_score(&idle).abs() < f64::EPSILON);
        assert!(burnout_risk(&idle).abs() < f64::EPSILON);
    }

    #[test]
    fn saturated_actor_scores_hundred() {
        let maxed = counters(15, 15, 45.0, 500, 30);
        assert!((workload_score(&maxed) - 100.0).abs() < 1e-9);
        assert!((burnout_risk(&maxed) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn half_load_is_weighted() {
        // tasks 0.5*0.5, overdue 0.2*0.2, meetings 0.2*0.5, messages 0.1*0.25
        let c = counters(5, 1, 15.0, 50, 0);
        assert!((workload_score(&c) - 41.5).abs() < 1e-9);
        assert!((burnout_risk(&c) - 24.9).abs() < 1e-9);
    }

    #[test]
    fn zero_capacity_counts_as_full() {
        let c = ActivityCounters {
            open_tasks: 1,
            task_capacity: 0,
            ..ActivityCounters::default()
        };
        assert!((workload_score(&c) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn severity_buckets() {
        assert_eq!(severity_for_score(95.0), Severity::Critical);
        assert_eq!(severity_for_score(70.0), Severity::High);
        assert_eq!(severity_for_score(55.0), Severity::Medium);
        assert_eq!(severity_for_score(10.0), Severity::Low);
    }

    #[test]
    fn snapshot_carries_scores() {
        let c = counters(5, 1, 15.0, 50, 0);
        let snap = snapshot(ActorId::new("u1"), &c, Utc::now());
        assert_eq!(snap.active_task_count, 5);
        assert!((snap.workload_score - 41.5).abs() < 1e-9);
    }
}
