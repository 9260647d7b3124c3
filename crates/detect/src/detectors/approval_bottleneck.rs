use std::sync::Arc;

use async_trait::async_trait;
use mender_core::{ActionType, AffectedEntity, DetectedPattern, OrganizationId, Severity};

use super::{USER_ENTITY, ratio};
use crate::detector::PatternDetector;
use crate::error::DetectError;
use crate::signals::{ApproverBacklog, SignalSource};

pub const PATTERN_TYPE: &str = "approval_bottleneck";

/// Flags approvers whose queue is too long or whose oldest request is too old.
pub struct ApprovalBottleneckDetector {
    source: Arc<dyn SignalSource>,
    min_pending: u32,
    max_age_minutes: u64,
}

impl ApprovalBottleneckDetector {
    /// Defaults: 5 pending requests, or one older than 24 hours.
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self {
            source,
            min_pending: 5,
            max_age_minutes: 24 * 60,
        }
    }

    #[must_use]
    pub fn with_thresholds(mut self, min_pending: u32, max_age_minutes: u64) -> Self {
        self.min_pending = min_pending.max(1);
        self.max_age_minutes = max_age_minutes.max(1);
        self
    }

    /// How far past the worse of the two thresholds a backlog is.
    fn pressure(&self, backlog: &ApproverBacklog) -> f64 {
        ratio(u64::from(backlog.pending), u64::from(self.min_pending))
            .max(ratio(backlog.oldest_pending_minutes, self.max_age_minutes))
    }

    fn pattern(&self, backlog: &ApproverBacklog) -> DetectedPattern {
        let pressure = self.pressure(backlog);
        let severity = match pressure {
            p if p >= 4.0 => Severity::Critical,
            p if p >= 2.0 => Severity::High,
            _ => Severity::Medium,
        };
        let hours = backlog.oldest_pending_minutes / 60;
        DetectedPattern::new(
            PATTERN_TYPE,
            format!(
                "{} has {} pending approvals, oldest waiting {hours}h",
                backlog.name, backlog.pending
            ),
            severity,
        )
        .with_entity(AffectedEntity::new(
            USER_ENTITY,
            backlog.approver_id.as_str(),
            backlog.name.clone(),
            (pressure / 4.0).min(1.0),
        ))
        .with_suggestion(ActionType::Notify, "remind the approver")
        .with_suggestion(ActionType::Redistribute, "route requests to another approver")
        .with_occurrences(backlog.pending)
    }
}

#[async_trait]
impl PatternDetector for ApprovalBottleneckDetector {
    fn pattern_type(&self) -> &str {
        PATTERN_TYPE
    }

    async fn detect(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<DetectedPattern>, DetectError> {
        let backlogs = self
            .source
            .approver_backlogs(organization, window_minutes)
            .await?;
        Ok(backlogs
            .iter()
            .filter(|b| {
                b.pending > 0
                    && (b.pending >= self.min_pending || b.oldest_pending_minutes >= self.max_age_minutes)
            })
            .map(|b| self.pattern(b))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use mender_core::ActorId;

    use super::*;
    use crate::signals::MemorySignalSource;

    fn backlog(id: &str, pending: u32, oldest_minutes: u64) -> ApproverBacklog {
        ApproverBacklog {
            approver_id: ActorId::new(id),
            name: id.to_uppercase(),
            pending,
            oldest_pending_minutes: oldest_minutes,
        }
    }

    #[tokio::test]
    async fn flags_long_and_stale_queues() {
        let source = Arc::new(MemorySignalSource::new());
        source.add_backlog("acme", backlog("ok", 2, 30));
        source.add_backlog("acme", backlog("long", 6, 30));
        source.add_backlog("acme", backlog("stale", 1, 3 * 24 * 60));
        source.add_backlog("acme", backlog("swamped", 25, 60));
        let detector = ApprovalBottleneckDetector::new(source);

        let patterns = detector.detect(&OrganizationId::new("acme"), 60).await.unwrap();
        let by_user: Vec<(&str, Severity)> = patterns
            .iter()
            .map(|p| (p.affected_entities[0].id.as_str(), p.severity))
            .collect();
        assert_eq!(
            by_user,
            vec![
                ("long", Severity::Medium),
                ("stale", Severity::High),
                ("swamped", Severity::Critical),
            ]
        );
        assert_eq!(patterns[2].occurrences, 25);
        assert!((patterns[2].affected_entities[0].impact - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn empty_organization_has_no_patterns() {
        let detector = ApprovalBottleneckDetector::new(Arc::new(MemorySignalSource::new()));
        assert!(
            detector
                .detect(&OrganizationId::new("quiet"), 60)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
