use thiserror::Error;

/// Errors raised by action handlers and the collaborators they call.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The action's configuration is unusable. Raised by `validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The entity the action should act on could not be determined.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// The handler ran and failed in a way another attempt will not fix.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The handler failed but a later attempt may succeed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The per-target attempt budget is used up.
    #[error("max attempts exceeded: {attempts} of {max_attempts}")]
    MaxAttemptsExceeded { attempts: u32, max_attempts: u32 },

    /// A collaborator (store, directory, workload source) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// The handler does not support rollback.
    #[error("rollback not supported for {0}")]
    RollbackUnsupported(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HandlerError {
    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Collaborator(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(HandlerError::Transient("timeout".into()).is_retryable());
        assert!(HandlerError::Collaborator("db down".into()).is_retryable());
    }

    #[test]
    fn non_retryable_errors() {
        assert!(!HandlerError::InvalidConfig("x".into()).is_retryable());
        assert!(!HandlerError::TargetNotFound("x".into()).is_retryable());
        assert!(!HandlerError::ExecutionFailed("x".into()).is_retryable());
        assert!(
            !HandlerError::MaxAttemptsExceeded {
                attempts: 4,
                max_attempts: 3
            }
            .is_retryable()
        );
    }

    #[test]
    fn error_display() {
        let err = HandlerError::MaxAttemptsExceeded {
            attempts: 4,
            max_attempts: 3,
        };
        assert_eq!(err.to_string(), "max attempts exceeded: 4 of 3");
        assert_eq!(
            HandlerError::TargetNotFound("no job id".into()).to_string(),
            "target not found: no job id"
        );
    }
}
