use std::sync::Arc;

use async_trait::async_trait;

use mender_core::{ActionId, OrganizationId, RetryState, retry_key};

use crate::error::StateError;
use crate::key::{KeyKind, StateKey};
use crate::store::StateStore;

/// Storage for per `(action, target)` retry bookkeeping.
///
/// Implementations must tolerate concurrent access from independent retry
/// timers. Single-writer-per-key is guaranteed by the engine's active-target
/// claim, so plain get/put semantics are sufficient.
#[async_trait]
pub trait RetryStateStore: Send + Sync {
    async fn get(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<Option<RetryState>, StateError>;

    async fn put(&self, organization: &OrganizationId, state: &RetryState)
    -> Result<(), StateError>;

    /// Remove the state. Returns `true` if it existed.
    async fn clear(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<bool, StateError>;
}

/// [`RetryStateStore`] persisted through a shared [`StateStore`], for
/// deployments where several engine instances must see the same attempts.
pub struct StateRetryStore {
    state: Arc<dyn StateStore>,
}

impl StateRetryStore {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    fn key(organization: &OrganizationId, action_id: &ActionId, target_id: &str) -> StateKey {
        StateKey::new(
            organization.clone(),
            KeyKind::RetryState,
            retry_key(action_id, target_id),
        )
    }
}

#[async_trait]
impl RetryStateStore for StateRetryStore {
    async fn get(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<Option<RetryState>, StateError> {
        let key = Self::key(organization, action_id, target_id);
        match self.state.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        organization: &OrganizationId,
        state: &RetryState,
    ) -> Result<(), StateError> {
        let key = Self::key(organization, &state.action_id, &state.target_id);
        let raw = serde_json::to_string(state)?;
        self.state.set(&key, &raw, None).await
    }

    async fn clear(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<bool, StateError> {
        self.state
            .delete(&Self::key(organization, action_id, target_id))
            .await
    }
}
