use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::time::Instant;

use mender_state::error::StateError;
use mender_state::key::{KeyKind, StateKey};
use mender_state::store::{CasResult, StateStore, Versioned};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn fresh(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_owned(),
            version: 1,
            expires_at: expiry_from_ttl(ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// In-memory [`StateStore`] backed by a [`DashMap`].
///
/// Entries are lazily evicted when touched after their TTL has elapsed.
/// Versions restart at 1 when an expired or deleted key is written again.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: DashMap<String, Entry>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries. Intended for tests.
    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, rendered: &str) {
        self.data.remove_if(rendered, |_, entry| entry.is_expired());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let rendered = key.canonical();
        self.evict_expired(&rendered);

        Ok(match self.data.entry(rendered) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::fresh(value, ttl));
                true
            }
        })
    }

    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    async fn get_versioned(&self, key: &StateKey) -> Result<Option<Versioned>, StateError> {
        let rendered = key.canonical();
        if let Some(entry) = self.data.get(&rendered) {
            if entry.is_expired() {
                drop(entry);
                self.evict_expired(&rendered);
                return Ok(None);
            }
            return Ok(Some(Versioned {
                value: entry.value.clone(),
                version: entry.version,
            }));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let rendered = key.canonical();
        self.evict_expired(&rendered);

        self.data
            .entry(rendered)
            .and_modify(|entry| {
                value.clone_into(&mut entry.value);
                entry.version += 1;
                entry.expires_at = expiry_from_ttl(ttl);
            })
            .or_insert_with(|| Entry::fresh(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        match self.data.remove(&key.canonical()) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError> {
        let rendered = key.canonical();
        self.evict_expired(&rendered);

        match self.data.entry(rendered) {
            MapEntry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Ok(CasResult::Conflict {
                        current_value: None,
                        current_version: 0,
                    });
                }
                vacant.insert(Entry::fresh(new_value, ttl));
                Ok(CasResult::Ok)
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.version != expected_version {
                    return Ok(CasResult::Conflict {
                        current_value: Some(entry.value.clone()),
                        current_version: entry.version,
                    });
                }
                new_value.clone_into(&mut entry.value);
                entry.version += 1;
                entry.expires_at = expiry_from_ttl(ttl).or(entry.expires_at);
                Ok(CasResult::Ok)
            }
        }
    }

    async fn scan_keys(
        &self,
        organization: &str,
        kind: KeyKind,
    ) -> Result<Vec<(String, String)>, StateError> {
        let prefix = StateKey::kind_prefix(organization, &kind);
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(&prefix) && !e.value().is_expired())
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect())
    }
}
