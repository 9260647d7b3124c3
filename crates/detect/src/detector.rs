use async_trait::async_trait;
use mender_core::{DetectedPattern, OrganizationId};

use crate::error::DetectError;

/// Scans organizational state for one kind of anomaly.
#[async_trait]
pub trait PatternDetector: Send + Sync {
    /// Key the detector is registered under, e.g. `approval_bottleneck`.
    fn pattern_type(&self) -> &str;

    /// Patterns observed in the trailing `window_minutes`.
    async fn detect(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<DetectedPattern>, DetectError>;
}
