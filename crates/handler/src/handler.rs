use async_trait::async_trait;
use mender_core::{ActionConfig, ActionExecution, ActionType, AutomatedAction, ExecutionId};

use crate::error::HandlerError;
use crate::outcome::HandlerOutcome;

/// Strongly-typed action handler trait with native `async fn`.
///
/// This trait is **not** object-safe. The engine stores handlers as
/// [`DynHandler`], which every `ActionHandler` implements through a blanket
/// implementation.
pub trait ActionHandler: Send + Sync {
    /// The action type this handler is registered under.
    fn action_type(&self) -> ActionType;

    /// Check a configuration before any execution is created.
    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError>;

    /// Carry out the action for one execution.
    fn execute(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> impl Future<Output = Result<HandlerOutcome, HandlerError>> + Send;

    /// Whether [`rollback`](Self::rollback) can reverse a completed run.
    fn can_rollback(&self) -> bool {
        false
    }

    /// Reverse a completed execution using the data it returned.
    fn rollback(
        &self,
        action: &AutomatedAction,
        execution_id: &ExecutionId,
        rollback_data: &serde_json::Value,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        let _ = (execution_id, rollback_data);
        let kind = action.action_type.as_str().to_owned();
        async move { Err(HandlerError::RollbackUnsupported(kind)) }
    }
}

/// Object-safe handler trait for use behind `Arc<dyn DynHandler>`.
///
/// Implement [`ActionHandler`] instead and rely on the blanket implementation.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn action_type(&self) -> ActionType;

    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError>;

    async fn execute(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> Result<HandlerOutcome, HandlerError>;

    fn can_rollback(&self) -> bool;

    async fn rollback(
        &self,
        action: &AutomatedAction,
        execution_id: &ExecutionId,
        rollback_data: &serde_json::Value,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: ActionHandler + Sync> DynHandler for T {
    fn action_type(&self) -> ActionType {
        ActionHandler::action_type(self)
    }

    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError> {
        ActionHandler::validate(self, config)
    }

    async fn execute(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> Result<HandlerOutcome, HandlerError> {
        ActionHandler::execute(self, action, execution).await
    }

    fn can_rollback(&self) -> bool {
        ActionHandler::can_rollback(self)
    }

    async fn rollback(
        &self,
        action: &AutomatedAction,
        execution_id: &ExecutionId,
        rollback_data: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        ActionHandler::rollback(self, action, execution_id, rollback_data).await
    }
}
