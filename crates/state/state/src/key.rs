use serde::{Deserialize, Serialize};

use mender_core::OrganizationId;

/// The kind of record being stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Serialized `ActionExecution`.
    Execution,
    /// Serialized `ApprovalRequest`.
    Approval,
    /// Serialized `AutomatedAction`.
    Action,
    /// Live `(action, target)` claim pointing at an execution id.
    ActiveTarget,
    /// Serialized `RetryState`.
    RetryState,
    Lock,
    Custom(String),
}

impl KeyKind {
    /// Return a string representation of the key kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Execution => "execution",
            Self::Approval => "approval",
            Self::Action => "action",
            Self::ActiveTarget => "active_target",
            Self::RetryState => "retry_state",
            Self::Lock => "lock",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used to address state entries in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub organization: OrganizationId,
    pub kind: KeyKind,
    pub id: String,
}

impl StateKey {
    /// Create a new state key.
    #[must_use]
    pub fn new(organization: impl Into<OrganizationId>, kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            kind,
            id: id.into(),
        }
    }

    /// Return a canonical string representation: `organization:kind:id`
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}:{}", self.organization, self.kind, self.id)
    }

    /// Prefix shared by every key of `kind` in `organization`.
    #[must_use]
    pub fn kind_prefix(organization: &str, kind: &KeyKind) -> String {
        format!("{organization}:{kind}:")
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_kind_as_str() {
        assert_eq!(KeyKind::Execution.as_str(), "execution");
        assert_eq!(KeyKind::Approval.as_str(), "approval");
        assert_eq!(KeyKind::ActiveTarget.as_str(), "active_target");
        assert_eq!(KeyKind::RetryState.as_str(), "retry_state");
        assert_eq!(KeyKind::Custom("foo".into()).as_str(), "foo");
    }

    #[test]
    fn state_key_canonical() {
        let key = StateKey::new("acme", KeyKind::Execution, "abc");
        assert_eq!(key.canonical(), "acme:execution:abc");
        assert!(key.canonical().starts_with(&StateKey::kind_prefix("acme", &KeyKind::Execution)));
    }
}
