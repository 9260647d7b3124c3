use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use mender_core::{
    ActionConfig, ActionExecution, ActionType, ActorId, AutomatedAction, EntityChange,
    ExecutionId, Notification, NotificationKind, OrganizationId, RedistributeConfig,
    TargetPool, TeamMember, WorkItem, WorkPriority,
};
use mender_handler::{
    ActionHandler, HandlerError, HandlerOutcome, HandlerResult, Notifier, USER_ENTITY,
    notify_all,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assignments::{AssignmentHistory, WorkAssignments};
use crate::strategy::Planner;

/// Items at or beyond this completion ratio stay with their owner.
pub const NEAR_COMPLETE_PROGRESS: f64 = 0.8;

const WORK_ITEM_ENTITY: &str = "work_item";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Reassignment {
    item_id: String,
    from_actor_id: ActorId,
    to_actor_id: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RedistributeRollback {
    source: ActorId,
    reassignments: Vec<Reassignment>,
}

/// Moves open work from an overloaded actor to pool members with headroom.
pub struct RedistributeHandler {
    assignments: Arc<dyn WorkAssignments>,
    notifier: Arc<dyn Notifier>,
}

impl RedistributeHandler {
    pub fn new(assignments: Arc<dyn WorkAssignments>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            assignments,
            notifier,
        }
    }

    fn config(action: &AutomatedAction) -> Result<&RedistributeConfig, HandlerError> {
        match &action.config {
            ActionConfig::Redistribute(cfg) => Ok(cfg),
            _ => Err(HandlerError::InvalidConfig("expected redistribute config".into())),
        }
    }

    async fn eligible_targets(
        &self,
        organization: &OrganizationId,
        cfg: &RedistributeConfig,
        source: &ActorId,
    ) -> Result<Vec<TeamMember>, HandlerError> {
        let members = self
            .assignments
            .pool_members(organization, &cfg.target_pool)
            .await?;
        Ok(members
            .into_iter()
            .filter(|m| m.active && &m.actor_id != source && !cfg.exclude_actor_ids.contains(&m.actor_id))
            .collect())
    }

    async fn notify_moves(
        &self,
        organization: &OrganizationId,
        execution_id: &ExecutionId,
        kind: NotificationKind,
        moves: &[Reassignment],
    ) -> usize {
        let mut notifications = Vec::with_capacity(moves.len() * 2);
        for m in moves {
            let (title, message) = match kind {
                NotificationKind::WorkReverted => (
                    "Work item returned",
                    format!("Work item {} was returned to {}", m.item_id, m.from_actor_id),
                ),
                _ => (
                    "Work item reassigned",
                    format!(
                        "Work item {} moved from {} to {}",
                        m.item_id, m.from_actor_id, m.to_actor_id
                    ),
                ),
            };
            let metadata = serde_json::json!({
                "execution_id": execution_id,
                "item_id": m.item_id,
            });
            for recipient in [&m.from_actor_id, &m.to_actor_id] {
                notifications.push(
                    Notification::new(
                        organization.clone(),
                        recipient.clone(),
                        kind,
                        title,
                        message.clone(),
                    )
                    .with_metadata(metadata.clone()),
                );
            }
        }
        notify_all(self.notifier.as_ref(), notifications).await
    }

    async fn recompute(&self, organization: &OrganizationId, actors: BTreeSet<ActorId>) {
        for actor in actors {
            if let Err(e) = self.assignments.recompute_workload(organization, &actor).await {
                warn!(actor_id = %actor, error = %e, "workload recompute failed");
            }
        }
    }
}

/// Drops near-complete and critical items, then orders the rest by priority
/// (highest first) and due date (earliest first, undated last).
pub fn redistributable(mut items: Vec<WorkItem>, max_items: usize) -> Vec<WorkItem> {
    items.retain(|i| i.progress < NEAR_COMPLETE_PROGRESS && i.priority != WorkPriority::Critical);
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.due_at, b.due_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    items.truncate(max_items);
    items
}

impl ActionHandler for RedistributeHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Redistribute
    }

    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError> {
        let ActionConfig::Redistribute(cfg) = config else {
            return Err(HandlerError::InvalidConfig(format!(
                "expected redistribute config, got {}",
                config.action_type()
            )));
        };
        if cfg.max_items == 0 {
            return Err(HandlerError::InvalidConfig("max_items must be at least 1".into()));
        }
        let empty_pool = match &cfg.target_pool {
            TargetPool::Actors { ids } => ids.is_empty(),
            TargetPool::Team { team_id } => team_id.trim().is_empty(),
            TargetPool::Department { department } => department.trim().is_empty(),
        };
        if empty_pool {
            return Err(HandlerError::InvalidConfig("target_pool must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> Result<HandlerOutcome, HandlerError> {
        let cfg = Self::config(action)?;
        let org = &action.organization_id;
        let source = cfg
            .source_actor_id
            .clone()
            .or_else(|| execution.target_id.clone().map(ActorId::new))
            .or_else(|| execution.context.resolve_target(Some(USER_ENTITY)).map(ActorId::new))
            .ok_or_else(|| HandlerError::TargetNotFound("no source actor in trigger context".into()))?;

        let targets = self.eligible_targets(org, cfg, &source).await?;
        let items = redistributable(self.assignments.open_items(org, &source).await?, cfg.max_items);
        if targets.is_empty() || items.is_empty() {
            info!(
                execution_id = %execution.id,
                source = %source,
                targets = targets.len(),
                items = items.len(),
                "nothing to redistribute"
            );
            return Ok(HandlerOutcome::completed(serde_json::json!({
                "source": source,
                "moved": 0,
                "skipped": 0,
            })));
        }

        let mut planner = Planner::new(cfg.strategy, targets);
        let mut moves = Vec::new();
        let mut changes = Vec::new();
        let mut skipped = 0usize;
        for item in &items {
            let Some(target) = planner.assign(item).map(|m| m.actor_id.clone()) else {
                debug!(item_id = %item.id, "no target can take item");
                skipped += 1;
                continue;
            };
            if let Err(e) = self.assignments.reassign(org, &item.id, &source, &target).await {
                warn!(item_id = %item.id, target = %target, error = %e, "reassignment failed");
                skipped += 1;
                continue;
            }
            if cfg.record_history {
                let entry = AssignmentHistory {
                    item_id: item.id.clone(),
                    from_actor_id: source.clone(),
                    to_actor_id: target.clone(),
                    execution_id: execution.id.clone(),
                    reason: execution.trigger_reason.clone(),
                    at: Utc::now(),
                };
                if let Err(e) = self.assignments.append_history(org, entry).await {
                    warn!(item_id = %item.id, error = %e, "history append failed");
                }
            }
            changes.push(EntityChange::new(
                WORK_ITEM_ENTITY,
                item.id.clone(),
                "owner_id",
                serde_json::json!(source),
                serde_json::json!(target),
            ));
            moves.push(Reassignment {
                item_id: item.id.clone(),
                from_actor_id: source.clone(),
                to_actor_id: target,
            });
        }

        if cfg.notify && !moves.is_empty() {
            self.notify_moves(org, &execution.id, NotificationKind::WorkReassigned, &moves)
                .await;
        }
        let mut touched: BTreeSet<ActorId> = moves.iter().map(|m| m.to_actor_id.clone()).collect();
        if !moves.is_empty() {
            touched.insert(source.clone());
        }
        self.recompute(org, touched).await;

        info!(
            execution_id = %execution.id,
            source = %source,
            moved = moves.len(),
            skipped,
            "redistribution applied"
        );
        let summary = serde_json::json!({
            "source": source,
            "moved": moves.len(),
            "skipped": skipped,
        });
        let mut result = HandlerResult::new(summary).with_changes(changes);
        if !moves.is_empty() {
            result = result.with_rollback_data(serde_json::to_value(RedistributeRollback {
                source,
                reassignments: moves,
            })?);
        }
        Ok(HandlerOutcome::Completed(result))
    }

    fn can_rollback(&self) -> bool {
        true
    }

    async fn rollback(
        &self,
        action: &AutomatedAction,
        execution_id: &ExecutionId,
        rollback_data: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        let data: RedistributeRollback = serde_json::from_value(rollback_data.clone())?;
        let org = &action.organization_id;
        let mut reverted = Vec::new();
        let mut failed = Vec::new();
        for m in data.reassignments {
            match self
                .assignments
                .reassign(org, &m.item_id, &m.to_actor_id, &m.from_actor_id)
                .await
            {
                Ok(()) => reverted.push(m),
                Err(e) => {
                    warn!(item_id = %m.item_id, error = %e, "revert failed");
                    failed.push(m.item_id);
                }
            }
        }

        self.notify_moves(org, execution_id, NotificationKind::WorkReverted, &reverted)
            .await;
        let mut touched: BTreeSet<ActorId> = reverted.iter().map(|m| m.to_actor_id.clone()).collect();
        if !reverted.is_empty() {
            touched.insert(data.source);
        }
        self.recompute(org, touched).await;

        if failed.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::RollbackFailed(format!(
                "could not return {} item(s): {}",
                failed.len(),
                failed.join(", ")
            )))
        }
    }
}
