use std::path::Path;
use std::time::Duration;

use mender_core::{ApprovalPolicy, OrganizationId};
use mender_engine::SweepConfig;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MenderConfig {
    pub engine: EngineConfig,
    pub background: BackgroundConfig,
    pub logging: LoggingConfig,
}

impl MenderConfig {
    /// Load from `path`, or fall back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "engine.default_max_attempts must be at least 1".into(),
            ));
        }
        let bg = &self.background;
        for (name, seconds) in [
            ("expiry_interval_seconds", bg.expiry_interval_seconds),
            ("escalation_interval_seconds", bg.escalation_interval_seconds),
            ("retry_interval_seconds", bg.retry_interval_seconds),
            ("lock_ttl_seconds", bg.lock_ttl_seconds),
        ] {
            if seconds == 0 {
                return Err(ConfigError::Invalid(format!(
                    "background.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Approval policy and executor defaults.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hours until a pending approval request expires.
    pub expiration_hours: u32,
    /// Hours a request may stay pending before escalation.
    pub escalate_after_hours: u32,
    pub notify_requester_on_expiry: bool,
    pub approver_roles: Vec<String>,
    pub escalation_roles: Vec<String>,
    /// Attempts given to actions that do not set their own.
    pub default_max_attempts: u32,
    /// Link audit entries into a per-organization hash chain.
    pub hash_chain_audit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = ApprovalPolicy::default();
        Self {
            expiration_hours: policy.expiration_hours,
            escalate_after_hours: policy.escalate_after_hours,
            notify_requester_on_expiry: policy.notify_requester_on_expiry,
            approver_roles: policy.approver_roles,
            escalation_roles: policy.escalation_roles,
            default_max_attempts: 1,
            hash_chain_audit: true,
        }
    }
}

impl EngineConfig {
    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            expiration_hours: self.expiration_hours,
            escalate_after_hours: self.escalate_after_hours,
            notify_requester_on_expiry: self.notify_requester_on_expiry,
            approver_roles: self.approver_roles.clone(),
            escalation_roles: self.escalation_roles.clone(),
        }
    }
}

/// Periodic sweep settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_field_names)]
pub struct BackgroundConfig {
    pub enabled: bool,
    pub expiry_interval_seconds: u64,
    pub escalation_interval_seconds: u64,
    pub retry_interval_seconds: u64,
    pub lock_ttl_seconds: u64,
    /// Organizations swept on every tick.
    pub organizations: Vec<String>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_interval_seconds: 60,
            escalation_interval_seconds: 300,
            retry_interval_seconds: 15,
            lock_ttl_seconds: 30,
            organizations: Vec::new(),
        }
    }
}

impl BackgroundConfig {
    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            expiry_interval: Duration::from_secs(self.expiry_interval_seconds),
            escalation_interval: Duration::from_secs(self.escalation_interval_seconds),
            retry_interval: Duration::from_secs(self.retry_interval_seconds),
            lock_ttl: Duration::from_secs(self.lock_ttl_seconds),
            enable_expiry: self.enabled,
            enable_escalation: self.enabled,
            enable_retries: self.enabled,
            organizations: self
                .organizations
                .iter()
                .map(|org| OrganizationId::new(org.as_str()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}
