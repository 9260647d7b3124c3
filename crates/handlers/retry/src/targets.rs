use async_trait::async_trait;
use dashmap::DashMap;
use mender_core::{OrganizationId, RetryTargetType};
use mender_handler::HandlerError;
use serde::{Deserialize, Serialize};

/// Outcome of one target-specific retry routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRetryResult {
    pub success: bool,
    pub previous_status: String,
    pub new_status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Domain operations the retry handler drives.
///
/// Each routine resets the target's status so it runs again, increments its
/// retry counter, and reports the status transition. A missing target is
/// reported as [`HandlerError::TargetNotFound`].
#[async_trait]
pub trait RetryTargets: Send + Sync {
    async fn retry_job(
        &self,
        organization: &OrganizationId,
        job_id: &str,
    ) -> Result<TargetRetryResult, HandlerError>;

    async fn retry_integration(
        &self,
        organization: &OrganizationId,
        integration_id: &str,
    ) -> Result<TargetRetryResult, HandlerError>;

    async fn retry_process_step(
        &self,
        organization: &OrganizationId,
        step_id: &str,
    ) -> Result<TargetRetryResult, HandlerError>;

    /// Put the target's status field back to `status`.
    async fn restore_status(
        &self,
        organization: &OrganizationId,
        target_type: RetryTargetType,
        target_id: &str,
        status: &str,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
struct TargetRecord {
    status: String,
    retry_count: u32,
    /// Number of upcoming retries that should fail.
    pending_failures: u32,
}

/// Process-local table of retryable targets.
///
/// Retrying a target moves it to the `pending` status unless a failure was
/// queued for it with [`fail_next`](Self::fail_next).
#[derive(Debug, Default)]
pub struct MemoryRetryTargets {
    targets: DashMap<(String, RetryTargetType, String), TargetRecord>,
}

/// Status a successfully retried target is put in.
pub const RETRIED_STATUS: &str = "pending";

impl MemoryRetryTargets {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(
        organization: &OrganizationId,
        target_type: RetryTargetType,
        id: &str,
    ) -> (String, RetryTargetType, String) {
        (organization.to_string(), target_type, id.to_owned())
    }

    pub fn insert(
        &self,
        organization: impl Into<OrganizationId>,
        target_type: RetryTargetType,
        id: &str,
        status: &str,
    ) {
        self.targets.insert(
            Self::key(&organization.into(), target_type, id),
            TargetRecord {
                status: status.to_owned(),
                retry_count: 0,
                pending_failures: 0,
            },
        );
    }

    /// Make the next `count` retries of the target fail.
    pub fn fail_next(
        &self,
        organization: impl Into<OrganizationId>,
        target_type: RetryTargetType,
        id: &str,
        count: u32,
    ) {
        if let Some(mut record) = self
            .targets
            .get_mut(&Self::key(&organization.into(), target_type, id))
        {
            record.pending_failures = count;
        }
    }

    pub fn status(
        &self,
        organization: impl Into<OrganizationId>,
        target_type: RetryTargetType,
        id: &str,
    ) -> Option<String> {
        self.targets
            .get(&Self::key(&organization.into(), target_type, id))
            .map(|r| r.status.clone())
    }

    pub fn retry_count(
        &self,
        organization: impl Into<OrganizationId>,
        target_type: RetryTargetType,
        id: &str,
    ) -> u32 {
        self.targets
            .get(&Self::key(&organization.into(), target_type, id))
            .map_or(0, |r| r.retry_count)
    }

    fn retry(
        &self,
        organization: &OrganizationId,
        target_type: RetryTargetType,
        id: &str,
    ) -> Result<TargetRetryResult, HandlerError> {
        let mut record = self
            .targets
            .get_mut(&Self::key(organization, target_type, id))
            .ok_or_else(|| HandlerError::TargetNotFound(format!("{} {id}", target_type.as_str())))?;

        record.retry_count += 1;
        let previous_status = record.status.clone();
        if record.pending_failures > 0 {
            record.pending_failures -= 1;
            return Ok(TargetRetryResult {
                success: false,
                new_status: previous_status.clone(),
                previous_status,
                error: Some(format!("{} {id} failed again", target_type.as_str())),
            });
        }

        RETRIED_STATUS.clone_into(&mut record.status);
        Ok(TargetRetryResult {
            success: true,
            previous_status,
            new_status: RETRIED_STATUS.to_owned(),
            error: None,
        })
    }
}

#[async_trait]
impl RetryTargets for MemoryRetryTargets {
    async fn retry_job(
        &self,
        organization: &OrganizationId,
        job_id: &str,
    ) -> Result<TargetRetryResult, HandlerError> {
        self.retry(organization, RetryTargetType::Job, job_id)
    }

    async fn retry_integration(
        &self,
        organization: &OrganizationId,
        integration_id: &str,
    ) -> Result<TargetRetryResult, HandlerError> {
        self.retry(organization, RetryTargetType::Integration, integration_id)
    }

    async fn retry_process_step(
        &self,
        organization: &OrganizationId,
        step_id: &str,
    ) -> Result<TargetRetryResult, HandlerError> {
        self.retry(organization, RetryTargetType::ProcessStep, step_id)
    }

    async fn restore_status(
        &self,
        organization: &OrganizationId,
        target_type: RetryTargetType,
        target_id: &str,
        status: &str,
    ) -> Result<(), HandlerError> {
        let mut record = self
            .targets
            .get_mut(&Self::key(organization, target_type, target_id))
            .ok_or_else(|| HandlerError::TargetNotFound(target_id.to_owned()))?;
        status.clone_into(&mut record.status);
        Ok(())
    }
}
