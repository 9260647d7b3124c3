use thiserror::Error;

/// Errors raised while running pattern detectors.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no detector registered for pattern type: {0}")]
    UnknownPattern(String),

    #[error("time window must be positive, got {0} minutes")]
    InvalidWindow(u32),

    #[error("signal source error: {0}")]
    Source(String),
}
