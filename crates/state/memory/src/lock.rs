use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use uuid::Uuid;

use mender_state::error::StateError;
use mender_state::lock::{DistributedLock, LockGuard};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

impl Lease {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`DistributedLock`] backed by a [`DashMap`].
///
/// Only coordinates tasks inside one process. Expired leases are evicted on
/// the next acquire attempt for the same name.
#[derive(Debug, Clone, Default)]
pub struct MemoryDistributedLock {
    leases: Arc<DashMap<String, Lease>>,
}

impl MemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryDistributedLock {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, StateError> {
        self.leases.remove_if(name, |_, lease| lease.is_expired());

        let owner = Uuid::new_v4().to_string();
        match self.leases.entry(name.to_owned()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(vacant) => {
                vacant.insert(Lease {
                    owner: owner.clone(),
                    expires_at: Instant::now() + ttl,
                });
                Ok(Some(Box::new(MemoryLockGuard {
                    leases: Arc::clone(&self.leases),
                    name: name.to_owned(),
                    owner,
                })))
            }
        }
    }
}

/// Guard for a lease taken through [`MemoryDistributedLock`].
#[derive(Debug)]
pub struct MemoryLockGuard {
    leases: Arc<DashMap<String, Lease>>,
    name: String,
    owner: String,
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn extend(&self, duration: Duration) -> Result<(), StateError> {
        let mut lease = self
            .leases
            .get_mut(&self.name)
            .ok_or_else(|| StateError::LockExpired(self.name.clone()))?;

        if lease.owner != self.owner || lease.is_expired() {
            return Err(StateError::LockExpired(self.name.clone()));
        }

        lease.expires_at = Instant::now() + duration;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), StateError> {
        self.leases
            .remove_if(&self.name, |_, lease| lease.owner == self.owner);
        Ok(())
    }

    async fn is_held(&self) -> Result<bool, StateError> {
        Ok(self
            .leases
            .get(&self.name)
            .is_some_and(|lease| lease.owner == self.owner && !lease.is_expired()))
    }
}
