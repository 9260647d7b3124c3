pub mod backoff;
pub mod handler;
pub mod targets;

pub use backoff::{ExponentialBackoff, MAX_RETRY_DELAY};
pub use handler::{MAX_CONFIGURED_ATTEMPTS, RetryHandler};
pub use targets::{MemoryRetryTargets, RETRIED_STATUS, RetryTargets, TargetRetryResult};
