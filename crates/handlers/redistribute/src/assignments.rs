use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mender_core::{
    ActorId, ExecutionId, OrganizationId, TargetPool, TeamMember, WorkItem, WorkloadSnapshot,
};
use mender_handler::HandlerError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::strategy::ITEM_COST;

/// One entry in a work item's ownership history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentHistory {
    pub item_id: String,
    pub from_actor_id: ActorId,
    pub to_actor_id: ActorId,
    pub execution_id: ExecutionId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Work-item and workload access the redistribute handler needs.
#[async_trait]
pub trait WorkAssignments: Send + Sync {
    /// Every member of the pool, active or not.
    async fn pool_members(
        &self,
        organization: &OrganizationId,
        pool: &TargetPool,
    ) -> Result<Vec<TeamMember>, HandlerError>;

    /// Open items currently owned by `owner`.
    async fn open_items(
        &self,
        organization: &OrganizationId,
        owner: &ActorId,
    ) -> Result<Vec<WorkItem>, HandlerError>;

    /// Move `item_id` from `from` to `to`. Fails if `from` no longer owns it.
    async fn reassign(
        &self,
        organization: &OrganizationId,
        item_id: &str,
        from: &ActorId,
        to: &ActorId,
    ) -> Result<(), HandlerError>;

    async fn append_history(
        &self,
        organization: &OrganizationId,
        entry: AssignmentHistory,
    ) -> Result<(), HandlerError>;

    async fn recompute_workload(
        &self,
        organization: &OrganizationId,
        actor: &ActorId,
    ) -> Result<WorkloadSnapshot, HandlerError>;
}

type OrgKey = (OrganizationId, String);

/// Process-local [`WorkAssignments`] for development and tests.
///
/// Reassigning an item moves [`ITEM_COST`] of workload from the old owner to
/// the new one.
#[derive(Debug, Default)]
pub struct MemoryWorkAssignments {
    members: DashMap<OrgKey, TeamMember>,
    teams: RwLock<HashMap<OrgKey, Vec<ActorId>>>,
    departments: RwLock<HashMap<OrgKey, Vec<ActorId>>>,
    items: DashMap<OrgKey, WorkItem>,
    history: RwLock<Vec<AssignmentHistory>>,
}

impl MemoryWorkAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(organization: &OrganizationId, id: &str) -> OrgKey {
        (organization.clone(), id.to_owned())
    }

    pub fn add_member(
        &self,
        organization: impl Into<OrganizationId>,
        member: TeamMember,
        team: Option<&str>,
        department: Option<&str>,
    ) {
        let org = organization.into();
        if let Some(team) = team {
            self.teams
                .write()
                .entry(Self::key(&org, team))
                .or_default()
                .push(member.actor_id.clone());
        }
        if let Some(department) = department {
            self.departments
                .write()
                .entry(Self::key(&org, department))
                .or_default()
                .push(member.actor_id.clone());
        }
        self.members
            .insert(Self::key(&org, member.actor_id.as_str()), member);
    }

    pub fn add_item(&self, organization: impl Into<OrganizationId>, item: WorkItem) {
        let org = organization.into();
        self.items.insert(Self::key(&org, &item.id), item);
    }

    pub fn member(&self, organization: &str, actor: &str) -> Option<TeamMember> {
        self.members
            .get(&Self::key(&OrganizationId::new(organization), actor))
            .map(|m| m.clone())
    }

    pub fn owner_of(&self, organization: &str, item_id: &str) -> Option<ActorId> {
        self.items
            .get(&Self::key(&OrganizationId::new(organization), item_id))
            .map(|i| i.owner_id.clone())
    }

    pub fn history(&self) -> Vec<AssignmentHistory> {
        self.history.read().clone()
    }

    fn members_of(&self, organization: &OrganizationId, ids: &[ActorId]) -> Vec<TeamMember> {
        ids.iter()
            .filter_map(|id| self.members.get(&Self::key(organization, id)).map(|m| m.clone()))
            .collect()
    }

    fn shift_load(&self, organization: &OrganizationId, actor: &ActorId, delta: f64) {
        if let Some(mut member) = self.members.get_mut(&Self::key(organization, actor)) {
            member.current_workload = (member.current_workload + delta).max(0.0);
        }
    }
}

#[async_trait]
impl WorkAssignments for MemoryWorkAssignments {
    async fn pool_members(
        &self,
        organization: &OrganizationId,
        pool: &TargetPool,
    ) -> Result<Vec<TeamMember>, HandlerError> {
        let ids = match pool {
            TargetPool::Actors { ids } => ids.clone(),
            TargetPool::Team { team_id } => self
                .teams
                .read()
                .get(&Self::key(organization, team_id))
                .cloned()
                .unwrap_or_default(),
            TargetPool::Department { department } => self
                .departments
                .read()
                .get(&Self::key(organization, department))
                .cloned()
                .unwrap_or_default(),
        };
        Ok(self.members_of(organization, &ids))
    }

    async fn open_items(
        &self,
        organization: &OrganizationId,
        owner: &ActorId,
    ) -> Result<Vec<WorkItem>, HandlerError> {
        Ok(self
            .items
            .iter()
            .filter(|e| &e.key().0 == organization && &e.value().owner_id == owner)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn reassign(
        &self,
        organization: &OrganizationId,
        item_id: &str,
        from: &ActorId,
        to: &ActorId,
    ) -> Result<(), HandlerError> {
        {
            let mut item = self
                .items
                .get_mut(&Self::key(organization, item_id))
                .ok_or_else(|| HandlerError::TargetNotFound(format!("work item {item_id}")))?;
            if &item.owner_id != from {
                return Err(HandlerError::ExecutionFailed(format!(
                    "work item {item_id} is owned by {}, not {from}",
                    item.owner_id
                )));
            }
            item.owner_id = to.clone();
        }
        self.shift_load(organization, from, -ITEM_COST);
        self.shift_load(organization, to, ITEM_COST);
        Ok(())
    }

    async fn append_history(
        &self,
        _organization: &OrganizationId,
        entry: AssignmentHistory,
    ) -> Result<(), HandlerError> {
        self.history.write().push(entry);
        Ok(())
    }

    async fn recompute_workload(
        &self,
        organization: &OrganizationId,
        actor: &ActorId,
    ) -> Result<WorkloadSnapshot, HandlerError> {
        let owned = self
            .items
            .iter()
            .filter(|e| &e.key().0 == organization && &e.value().owner_id == actor)
            .count();
        let mut member = self
            .members
            .get_mut(&Self::key(organization, actor))
            .ok_or_else(|| HandlerError::TargetNotFound(format!("actor {actor}")))?;
        member.active_task_count = u32::try_from(owned).unwrap_or(u32::MAX);
        let score = if member.max_workload > 0.0 {
            (member.current_workload / member.max_workload * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        Ok(WorkloadSnapshot {
            actor_id: actor.clone(),
            workload_score: score,
            burnout_risk: score,
            active_task_count: member.active_task_count,
            computed_at: Utc::now(),
        })
    }
}
