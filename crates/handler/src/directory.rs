use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use mender_core::{ActorId, OrganizationId};

use crate::error::HandlerError;

/// Lookup of actors by role, used to address approval notifications.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    /// Every actor in `organization` holding at least one of `roles`,
    /// without duplicates.
    async fn actors_with_roles(
        &self,
        organization: &OrganizationId,
        roles: &[String],
    ) -> Result<Vec<ActorId>, HandlerError>;
}

/// Directory backed by a fixed `role -> actors` table per organization.
#[derive(Debug, Default, Clone)]
pub struct StaticActorDirectory {
    roles: HashMap<OrganizationId, HashMap<String, Vec<ActorId>>>,
}

impl StaticActorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_role(
        mut self,
        organization: impl Into<OrganizationId>,
        role: impl Into<String>,
        actors: &[&str],
    ) -> Self {
        self.insert(organization, role, actors.iter().map(|a| ActorId::new(*a)));
        self
    }

    pub fn insert(
        &mut self,
        organization: impl Into<OrganizationId>,
        role: impl Into<String>,
        actors: impl IntoIterator<Item = ActorId>,
    ) {
        self.roles
            .entry(organization.into())
            .or_default()
            .entry(role.into())
            .or_default()
            .extend(actors);
    }
}

#[async_trait]
impl ActorDirectory for StaticActorDirectory {
    async fn actors_with_roles(
        &self,
        organization: &OrganizationId,
        roles: &[String],
    ) -> Result<Vec<ActorId>, HandlerError> {
        let Some(by_role) = self.roles.get(organization) else {
            return Ok(Vec::new());
        };
        let unique: BTreeSet<ActorId> = roles
            .iter()
            .filter_map(|role| by_role.get(role))
            .flatten()
            .cloned()
            .collect();
        Ok(unique.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_roles_without_duplicates() {
        let dir = StaticActorDirectory::new()
            .with_role("acme", "admin", &["ana", "bo"])
            .with_role("acme", "manager", &["bo", "cy"])
            .with_role("globex", "admin", &["zed"]);

        let found = dir
            .actors_with_roles(
                &OrganizationId::new("acme"),
                &["admin".to_owned(), "manager".to_owned()],
            )
            .await
            .unwrap();
        assert_eq!(
            found,
            vec![ActorId::new("ana"), ActorId::new("bo"), ActorId::new("cy")]
        );

        let none = dir
            .actors_with_roles(&OrganizationId::new("initech"), &["admin".to_owned()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
