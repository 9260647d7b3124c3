use std::sync::Arc;

use async_trait::async_trait;
use mender_core::{ActionType, AffectedEntity, DetectedPattern, OrganizationId, Severity};

use super::{PROCESS_STEP_ENTITY, USER_ENTITY, ratio};
use crate::detector::PatternDetector;
use crate::error::DetectError;
use crate::signals::{SignalSource, StalledStep};

pub const PATTERN_TYPE: &str = "stuck_workflow";

/// Flags process steps that have not advanced for longer than a threshold.
///
/// The step is the first affected entity so retry actions resolve it as
/// their target; the assignee, if any, follows as a `user` entity.
pub struct StuckWorkflowDetector {
    source: Arc<dyn SignalSource>,
    stall_minutes: u64,
}

impl StuckWorkflowDetector {
    /// Default threshold: two hours.
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self {
            source,
            stall_minutes: 120,
        }
    }

    #[must_use]
    pub fn with_stall_minutes(mut self, minutes: u64) -> Self {
        self.stall_minutes = minutes.max(1);
        self
    }

    fn pattern(&self, step: StalledStep) -> DetectedPattern {
        let overdue = ratio(step.stalled_minutes, self.stall_minutes);
        let severity = match overdue {
            r if r >= 8.0 => Severity::Critical,
            r if r >= 4.0 => Severity::High,
            r if r >= 2.0 => Severity::Medium,
            _ => Severity::Low,
        };
        let mut pattern = DetectedPattern::new(
            PATTERN_TYPE,
            format!(
                "step '{}' of process {} has not advanced for {} minutes",
                step.name, step.process_id, step.stalled_minutes
            ),
            severity,
        )
        .with_entity(AffectedEntity::new(
            PROCESS_STEP_ENTITY,
            step.step_id,
            step.name,
            (overdue / 8.0).min(1.0),
        ))
        .with_suggestion(ActionType::Retry, "retry the stalled step");
        if let Some(assignee) = step.assignee_id {
            pattern = pattern
                .with_entity(AffectedEntity::new(
                    USER_ENTITY,
                    assignee.as_str(),
                    assignee.as_str(),
                    0.5,
                ))
                .with_suggestion(ActionType::Notify, "nudge the assignee");
        }
        pattern
    }
}

#[async_trait]
impl PatternDetector for StuckWorkflowDetector {
    fn pattern_type(&self) -> &str {
        PATTERN_TYPE
    }

    async fn detect(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<DetectedPattern>, DetectError> {
        let steps = self.source.stalled_steps(organization, window_minutes).await?;
        Ok(steps
            .into_iter()
            .filter(|s| s.stalled_minutes >= self.stall_minutes)
            .map(|s| self.pattern(s))
            .collect())
    }
}
