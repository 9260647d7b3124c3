use std::collections::BTreeSet;
use std::sync::Arc;

use mender_core::{
    ActionConfig, ActionExecution, ActionType, ActorId, AutomatedAction, Notification,
    NotificationKind,
};
use tracing::debug;

use crate::error::HandlerError;
use crate::handler::ActionHandler;
use crate::notifier::{Notifier, notify_all};
use crate::outcome::HandlerOutcome;

/// Entity type the detectors use for people.
pub const USER_ENTITY: &str = "user";

/// Sends a fixed message to configured recipients and, optionally, to every
/// user affected by the triggering pattern. Cannot be rolled back.
pub struct NotifyHandler {
    notifier: Arc<dyn Notifier>,
}

impl NotifyHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl ActionHandler for NotifyHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Notify
    }

    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError> {
        let ActionConfig::Notify(cfg) = config else {
            return Err(HandlerError::InvalidConfig(format!(
                "expected notify config, got {}",
                config.action_type()
            )));
        };
        if cfg.title.trim().is_empty() {
            return Err(HandlerError::InvalidConfig("title must not be empty".into()));
        }
        if cfg.recipients.is_empty() && !cfg.notify_affected {
            return Err(HandlerError::InvalidConfig(
                "recipients must not be empty unless notify_affected is set".into(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> Result<HandlerOutcome, HandlerError> {
        let ActionConfig::Notify(cfg) = &action.config else {
            return Err(HandlerError::InvalidConfig("expected notify config".into()));
        };

        let mut recipients: BTreeSet<ActorId> = cfg.recipients.iter().cloned().collect();
        if cfg.notify_affected
            && let Some(pattern) = &execution.context.pattern
        {
            recipients.extend(
                pattern
                    .affected_entities
                    .iter()
                    .filter(|e| e.entity_type == USER_ENTITY)
                    .map(|e| ActorId::new(e.id.clone())),
            );
        }
        if recipients.is_empty() {
            return Err(HandlerError::TargetNotFound("no notification recipients".into()));
        }

        let notifications: Vec<Notification> = recipients
            .iter()
            .map(|recipient| {
                Notification::new(
                    action.organization_id.clone(),
                    recipient.clone(),
                    NotificationKind::Remediation,
                    cfg.title.clone(),
                    cfg.message.clone(),
                )
                .with_metadata(serde_json::json!({
                    "action_id": action.id,
                    "execution_id": execution.id,
                    "trigger_reason": execution.trigger_reason,
                }))
            })
            .collect();
        let requested = notifications.len();
        let delivered = notify_all(self.notifier.as_ref(), notifications).await;
        debug!(execution_id = %execution.id, requested, delivered, "notify action sent");

        Ok(HandlerOutcome::completed(serde_json::json!({
            "recipients": recipients,
            "delivered": delivered,
        })))
    }
}
