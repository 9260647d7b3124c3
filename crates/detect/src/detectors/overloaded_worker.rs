use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mender_core::{ActionType, AffectedEntity, DetectedPattern, OrganizationId};

use super::USER_ENTITY;
use crate::analyzer::{self, severity_for_score};
use crate::detector::PatternDetector;
use crate::error::DetectError;
use crate::signals::SignalSource;

pub const PATTERN_TYPE: &str = "overloaded_worker";

/// Flags actors whose workload score crosses a threshold. Severity follows
/// burnout risk, which can be higher than the workload score.
pub struct OverloadedWorkerDetector {
    source: Arc<dyn SignalSource>,
    threshold: f64,
}

impl OverloadedWorkerDetector {
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self {
            source,
            threshold: 75.0,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 100.0);
        self
    }
}

#[async_trait]
impl PatternDetector for OverloadedWorkerDetector {
    fn pattern_type(&self) -> &str {
        PATTERN_TYPE
    }

    async fn detect(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<DetectedPattern>, DetectError> {
        let now = Utc::now();
        let activity = self.source.actor_activity(organization, window_minutes).await?;
        let mut patterns: Vec<DetectedPattern> = activity
            .into_iter()
            .filter_map(|a| {
                let snap = analyzer::snapshot(a.actor_id.clone(), &a.counters, now);
                (snap.workload_score >= self.threshold).then(|| {
                    let severity =
                        severity_for_score(snap.burnout_risk.max(snap.workload_score));
                    DetectedPattern::new(
                        PATTERN_TYPE,
                        format!(
                            "{} is at workload {:.0} with {} open tasks (burnout risk {:.0})",
                            a.name, snap.workload_score, snap.active_task_count, snap.burnout_risk
                        ),
                        severity,
                    )
                    .with_entity(AffectedEntity::new(
                        USER_ENTITY,
                        a.actor_id.as_str(),
                        a.name,
                        snap.workload_score / 100.0,
                    ))
                    .with_suggestion(ActionType::Redistribute, "move open work to teammates")
                })
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.affected_entities[0]
                .impact
                .total_cmp(&a.affected_entities[0].impact)
        });
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use mender_core::{ActorId, Severity};

    use super::*;
    use crate::analyzer::ActivityCounters;
    use crate::signals::{ActorActivity, MemorySignalSource};

    fn activity(id: &str, open: u32, overdue: u32, meetings: f64, after: u32) -> ActorActivity {
        ActorActivity {
            actor_id: ActorId::new(id),
            name: id.to_owned(),
            counters: ActivityCounters {
                open_tasks: open,
                overdue_tasks: overdue,
                meeting_hours: meetings,
                messages_sent: 200,
                after_hours_events: after,
                ..ActivityCounters::default()
            },
        }
    }

    #[tokio::test]
    async fn flags_only_actors_over_threshold() {
        let source = Arc::new(MemorySignalSource::new());
        // 0.5 + 0.2*0.2 + 0.2*0.5 + 0.1 = 74
        source.add_activity("acme", activity("steady", 10, 2, 15.0, 0));
        // 0.5 + 0.2*0.5 + 0.2 + 0.1 = 90
        source.add_activity("acme", activity("swamped", 12, 6, 30.0, 20));
        // 0.5 + 0 + 0.2 + 0.1 = 80
        source.add_activity("acme", activity("busy", 10, 0, 30.0, 0));
        let detector = OverloadedWorkerDetector::new(source);

        let patterns = detector.detect(&OrganizationId::new("acme"), 60 * 24).await.unwrap();
        let ids: Vec<&str> = patterns
            .iter()
            .map(|p| p.affected_entities[0].id.as_str())
            .collect();
        assert_eq!(ids, vec!["swamped", "busy"]);
        assert_eq!(patterns[0].severity, Severity::Critical);
        assert_eq!(patterns[1].severity, Severity::High);
        assert_eq!(patterns[0].suggested_actions[0].action_type, ActionType::Redistribute);
    }

    #[tokio::test]
    async fn threshold_is_configurable() {
        let source = Arc::new(MemorySignalSource::new());
        source.add_activity("acme", activity("steady", 10, 2, 15.0, 0));
        let detector = OverloadedWorkerDetector::new(source).with_threshold(70.0);
        let patterns = detector.detect(&OrganizationId::new("acme"), 60).await.unwrap();
        assert_eq!(patterns.len(), 1);
    }
}
