//! Process wiring for the `mender-daemon` binary.

pub mod config;
pub mod telemetry;

use std::sync::Arc;

use mender_audit_memory::MemoryAuditStore;
use mender_engine::{EngineBuilder, EngineError, RemediationEngine};
use mender_handler::LogNotifier;
use mender_redistribute::{MemoryWorkAssignments, RedistributeHandler};
use mender_retry::{MemoryRetryTargets, RetryHandler};
use mender_state_memory::{MemoryDistributedLock, MemoryRetryStore, MemoryStateStore};
use tracing::info;

use crate::config::MenderConfig;

/// Build an engine on the in-process backends.
///
/// Retry and redistribute handlers are wired to process-local target tables;
/// notifications go to the log.
pub fn build_engine(config: &MenderConfig) -> Result<RemediationEngine, EngineError> {
    let notifier = Arc::new(LogNotifier::new());
    let engine = EngineBuilder::new()
        .state(Arc::new(MemoryStateStore::new()))
        .lock(Arc::new(MemoryDistributedLock::new()))
        .audit(Arc::new(MemoryAuditStore::new()))
        .notifier(notifier.clone())
        .policy(config.engine.approval_policy())
        .hash_chain(config.engine.hash_chain_audit)
        .default_max_attempts(config.engine.default_max_attempts)
        .handler(Arc::new(RetryHandler::new(
            Arc::new(MemoryRetryTargets::new()),
            Arc::new(MemoryRetryStore::new()),
        )))
        .handler(Arc::new(RedistributeHandler::new(
            Arc::new(MemoryWorkAssignments::new()),
            notifier,
        )))
        .build()?;
    info!(
        hash_chain = config.engine.hash_chain_audit,
        expiration_hours = config.engine.expiration_hours,
        escalate_after_hours = config.engine.escalate_after_hours,
        "engine built on in-memory backends"
    );
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use mender_core::{ActionId, ExecutionStatus, OrganizationId, TriggerContext};
    use mender_engine::{BackgroundSweeper, SweepReport};
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn default_config_builds_a_working_engine() {
        let config: MenderConfig = toml::from_str("").unwrap();
        let engine = build_engine(&config).unwrap();
        assert_eq!(engine.policy().expiration_hours, 24);

        let action = mender_core::AutomatedAction::new(
            "announce",
            "acme",
            "announce",
            mender_core::ActionConfig::Notify(mender_core::NotifyConfig {
                recipients: vec!["oscar".into()],
                notify_affected: false,
                title: "heads up".into(),
                message: "queue is draining".into(),
            }),
        );
        engine.register_action(action).await.unwrap();
        let exec = engine
            .trigger(
                &OrganizationId::new("acme"),
                &ActionId::new("announce"),
                TriggerContext::new("manual"),
            )
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(engine.verify_audit_chain(&OrganizationId::new("acme")).await.unwrap().valid);
    }

    #[tokio::test]
    async fn one_shot_sweep_over_configured_organizations() {
        let config: MenderConfig =
            toml::from_str("[background]\norganizations = [\"acme\"]").unwrap();
        let engine = Arc::new(build_engine(&config).unwrap());
        let (_tx, rx) = mpsc::channel(1);
        let sweeper = BackgroundSweeper::new(engine, config.background.sweep_config(), rx);
        assert_eq!(sweeper.run_once().await, SweepReport::default());
    }
}
