use std::collections::HashMap;

use async_trait::async_trait;
use mender_core::{ActorId, OrganizationId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::analyzer::ActivityCounters;
use crate::error::DetectError;

/// Pending approvals waiting on one approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverBacklog {
    pub approver_id: ActorId,
    pub name: String,
    pub pending: u32,
    /// Age of the oldest pending request.
    pub oldest_pending_minutes: u64,
}

/// Activity counters for one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorActivity {
    pub actor_id: ActorId,
    pub name: String,
    pub counters: ActivityCounters,
}

/// A process step that has not advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledStep {
    pub step_id: String,
    pub process_id: String,
    pub name: String,
    #[serde(default)]
    pub assignee_id: Option<ActorId>,
    pub stalled_minutes: u64,
}

/// Read-only organizational signals the detectors scan.
///
/// Implementations bind every filter as a query parameter; the window is
/// never spliced into query text.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn approver_backlogs(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<ApproverBacklog>, DetectError>;

    async fn actor_activity(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<ActorActivity>, DetectError>;

    async fn stalled_steps(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<StalledStep>, DetectError>;
}

#[derive(Debug, Default, Clone)]
struct OrgSignals {
    backlogs: Vec<ApproverBacklog>,
    activity: Vec<ActorActivity>,
    stalled: Vec<StalledStep>,
}

/// In-memory [`SignalSource`] seeded by hand. Ignores the window.
#[derive(Debug, Default)]
pub struct MemorySignalSource {
    orgs: RwLock<HashMap<OrganizationId, OrgSignals>>,
}

impl MemorySignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_backlog(&self, organization: impl Into<OrganizationId>, backlog: ApproverBacklog) {
        self.orgs
            .write()
            .entry(organization.into())
            .or_default()
            .backlogs
            .push(backlog);
    }

    pub fn add_activity(&self, organization: impl Into<OrganizationId>, activity: ActorActivity) {
        self.orgs
            .write()
            .entry(organization.into())
            .or_default()
            .activity
            .push(activity);
    }

    pub fn add_stalled_step(&self, organization: impl Into<OrganizationId>, step: StalledStep) {
        self.orgs
            .write()
            .entry(organization.into())
            .or_default()
            .stalled
            .push(step);
    }

    fn read<T>(&self, organization: &OrganizationId, f: impl FnOnce(&OrgSignals) -> T) -> Option<T> {
        self.orgs.read().get(organization).map(f)
    }
}

#[async_trait]
impl SignalSource for MemorySignalSource {
    async fn approver_backlogs(
        &self,
        organization: &OrganizationId,
        _window_minutes: u32,
    ) -> Result<Vec<ApproverBacklog>, DetectError> {
        Ok(self
            .read(organization, |s| s.backlogs.clone())
            .unwrap_or_default())
    }

    async fn actor_activity(
        &self,
        organization: &OrganizationId,
        _window_minutes: u32,
    ) -> Result<Vec<ActorActivity>, DetectError> {
        Ok(self
            .read(organization, |s| s.activity.clone())
            .unwrap_or_default())
    }

    async fn stalled_steps(
        &self,
        organization: &OrganizationId,
        _window_minutes: u32,
    ) -> Result<Vec<StalledStep>, DetectError> {
        Ok(self
            .read(organization, |s| s.stalled.clone())
            .unwrap_or_default())
    }
}
