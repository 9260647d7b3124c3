use async_trait::async_trait;
use dashmap::DashMap;

use mender_core::{ActionId, OrganizationId, RetryState, retry_key};
use mender_state::error::StateError;
use mender_state::retry::RetryStateStore;

/// In-memory [`RetryStateStore`] keyed by organization and composite retry key.
#[derive(Debug, Default)]
pub struct MemoryRetryStore {
    states: DashMap<(OrganizationId, String), RetryState>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> (OrganizationId, String) {
        (organization.clone(), retry_key(action_id, target_id))
    }
}

#[async_trait]
impl RetryStateStore for MemoryRetryStore {
    async fn get(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<Option<RetryState>, StateError> {
        Ok(self
            .states
            .get(&Self::key(organization, action_id, target_id))
            .map(|s| s.clone()))
    }

    async fn put(
        &self,
        organization: &OrganizationId,
        state: &RetryState,
    ) -> Result<(), StateError> {
        self.states.insert(
            Self::key(organization, &state.action_id, &state.target_id),
            state.clone(),
        );
        Ok(())
    }

    async fn clear(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<bool, StateError> {
        Ok(self
            .states
            .remove(&Self::key(organization, action_id, target_id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mender_state::StateRetryStore;
    use mender_state::testing::run_retry_conformance_tests;

    use super::*;
    use crate::MemoryStateStore;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryRetryStore::new();
        run_retry_conformance_tests(&store)
            .await
            .expect("retry conformance tests should pass");
    }

    #[tokio::test]
    async fn state_backed_conformance() {
        let store = StateRetryStore::new(Arc::new(MemoryStateStore::new()));
        run_retry_conformance_tests(&store)
            .await
            .expect("state-backed retry store should pass conformance");
    }
}
