use std::collections::HashMap;
use std::sync::Arc;

use mender_core::{DetectedPattern, OrganizationId};
use tracing::{debug, warn};

use crate::detector::PatternDetector;
use crate::detectors::{ApprovalBottleneckDetector, OverloadedWorkerDetector, StuckWorkflowDetector};
use crate::error::DetectError;
use crate::signals::SignalSource;

/// Maps pattern types to detectors.
///
/// Built once at startup, then shared behind an `Arc`.
pub struct DetectorRegistry {
    detectors: HashMap<String, Arc<dyn PatternDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
        }
    }

    /// A registry holding the three built-in detectors with default thresholds.
    pub fn with_defaults(source: &Arc<dyn SignalSource>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ApprovalBottleneckDetector::new(Arc::clone(source))));
        registry.register(Arc::new(OverloadedWorkerDetector::new(Arc::clone(source))));
        registry.register(Arc::new(StuckWorkflowDetector::new(Arc::clone(source))));
        registry
    }

    /// Register a detector under its pattern type, replacing any previous one.
    pub fn register(&mut self, detector: Arc<dyn PatternDetector>) {
        self.detectors
            .insert(detector.pattern_type().to_owned(), detector);
    }

    pub fn get(&self, pattern_type: &str) -> Option<Arc<dyn PatternDetector>> {
        self.detectors.get(pattern_type).cloned()
    }

    /// Registered pattern types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.detectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run one detector.
    pub async fn detect(
        &self,
        pattern_type: &str,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<DetectedPattern>, DetectError> {
        if window_minutes == 0 {
            return Err(DetectError::InvalidWindow(window_minutes));
        }
        let detector = self
            .get(pattern_type)
            .ok_or_else(|| DetectError::UnknownPattern(pattern_type.to_owned()))?;
        detector.detect(organization, window_minutes).await
    }

    /// Run every detector, most severe patterns first.
    ///
    /// A failing detector is logged and skipped.
    pub async fn detect_all(
        &self,
        organization: &OrganizationId,
        window_minutes: u32,
    ) -> Result<Vec<DetectedPattern>, DetectError> {
        if window_minutes == 0 {
            return Err(DetectError::InvalidWindow(window_minutes));
        }
        let mut patterns = Vec::new();
        for name in self.list() {
            let Some(detector) = self.detectors.get(name) else {
                continue;
            };
            match detector.detect(organization, window_minutes).await {
                Ok(found) => {
                    debug!(pattern_type = name, found = found.len(), "detector ran");
                    patterns.extend(found);
                }
                Err(e) => warn!(pattern_type = name, error = %e, "detector failed"),
            }
        }
        patterns.sort_by(|a, b| b.severity.cmp(&a.severity));
        Ok(patterns)
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("detectors", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mender_core::Severity;

    use super::*;
    use crate::signals::MemorySignalSource;

    struct Fixed {
        name: &'static str,
        severity: Option<Severity>,
    }

    #[async_trait]
    impl PatternDetector for Fixed {
        fn pattern_type(&self) -> &str {
            self.name
        }

        async fn detect(
            &self,
            _organization: &OrganizationId,
            _window_minutes: u32,
        ) -> Result<Vec<DetectedPattern>, DetectError> {
            match self.severity {
                Some(severity) => Ok(vec![DetectedPattern::new(self.name, "fixed", severity)]),
                None => Err(DetectError::Source("offline".into())),
            }
        }
    }

    #[test]
    fn defaults_register_three_detectors() {
        let source: Arc<dyn SignalSource> = Arc::new(MemorySignalSource::new());
        let registry = DetectorRegistry::with_defaults(&source);
        assert_eq!(
            registry.list(),
            vec!["approval_bottleneck", "overloaded_worker", "stuck_workflow"]
        );
    }

    #[tokio::test]
    async fn unknown_pattern_is_an_error() {
        let registry = DetectorRegistry::new();
        let err = registry
            .detect("nope", &OrganizationId::new("acme"), 60)
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::UnknownPattern(_)));
    }

    #[tokio::test]
    async fn zero_window_is_rejected() {
        let mut registry = DetectorRegistry::new();
        registry.register(Arc::new(Fixed {
            name: "a",
            severity: Some(Severity::Low),
        }));
        let org = OrganizationId::new("acme");
        assert!(matches!(
            registry.detect("a", &org, 0).await,
            Err(DetectError::InvalidWindow(0))
        ));
        assert!(registry.detect_all(&org, 0).await.is_err());
    }

    #[tokio::test]
    async fn detect_all_skips_failures_and_sorts_by_severity() {
        let mut registry = DetectorRegistry::new();
        registry.register(Arc::new(Fixed {
            name: "low",
            severity: Some(Severity::Low),
        }));
        registry.register(Arc::new(Fixed {
            name: "broken",
            severity: None,
        }));
        registry.register(Arc::new(Fixed {
            name: "critical",
            severity: Some(Severity::Critical),
        }));

        let patterns = registry
            .detect_all(&OrganizationId::new("acme"), 60)
            .await
            .unwrap();
        let types: Vec<&str> = patterns.iter().map(|p| p.pattern_type.as_str()).collect();
        assert_eq!(types, vec!["critical", "low"]);
    }
}
