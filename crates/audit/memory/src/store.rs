use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use mender_audit::error::AuditError;
use mender_audit::record::{AuditEntry, AuditOrder, AuditPage, AuditQuery};
use mender_audit::store::AuditStore;

/// In-memory audit store using `DashMap`. Suitable for development and testing.
///
/// Each entry is tagged with an insertion counter so that entries recorded
/// within the same clock tick still come back in the order they were written.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: DashMap<String, (u64, AuditEntry)>,
    next_insert: AtomicU64,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        match self.entries.entry(entry.id.clone()) {
            Entry::Occupied(_) => Err(AuditError::Duplicate(entry.id)),
            Entry::Vacant(vacant) => {
                let position = self.next_insert.fetch_add(1, Ordering::Relaxed);
                vacant.insert((position, entry));
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<AuditEntry>, AuditError> {
        Ok(self.entries.get(id).map(|e| e.value().1.clone()))
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let limit = query.effective_limit();
        let offset = query.effective_offset();

        let mut matching: Vec<(u64, AuditEntry)> = self
            .entries
            .iter()
            .filter(|e| query.matches(&e.value().1))
            .map(|e| e.value().clone())
            .collect();

        match query.order {
            AuditOrder::NewestFirst => matching.sort_by(|(pa, a), (pb, b)| {
                b.timestamp.cmp(&a.timestamp).then_with(|| pb.cmp(pa))
            }),
            AuditOrder::SequenceAsc => {
                matching.sort_by_key(|(position, e)| (e.sequence_number, *position));
            }
            AuditOrder::SequenceDesc => matching.sort_by(|(pa, a), (pb, b)| {
                b.sequence_number
                    .cmp(&a.sequence_number)
                    .then_with(|| pb.cmp(pa))
            }),
        }

        let total = matching.len() as u64;
        let entries = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(_, e)| e)
            .collect();

        Ok(AuditPage {
            entries,
            total,
            limit,
            offset,
        })
    }
}
