//! Tamper-evident audit chain.
//!
//! [`HashChainAuditStore`] links every entry of an organization to its
//! predecessor with a `SHA-256` digest so that edits or deletions in the
//! backing store are detectable through [`HashChainAuditStore::verify_chain`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::AuditError;
use crate::record::{AuditEntry, AuditOrder, AuditPage, AuditQuery};
use crate::store::AuditStore;

const VERIFY_PAGE_SIZE: u32 = 1000;

#[derive(Clone, Debug)]
struct ChainTip {
    record_hash: String,
    sequence_number: u64,
}

/// Outcome of walking an organization's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashChainVerification {
    pub valid: bool,
    pub entries_checked: u64,
    /// Id of the first entry whose hash or back-link does not match.
    pub first_broken_at: Option<String>,
    pub first_entry_id: Option<String>,
    pub last_entry_id: Option<String>,
}

/// An audit store decorator that computes `SHA-256` hash chains per organization.
///
/// Each entry receives the `record_hash` of its predecessor as
/// `previous_hash`, its own digest, and a sequence number starting at 0.
/// The chain tip is cached; on the first write for an organization it is
/// discovered from the inner store.
pub struct HashChainAuditStore {
    inner: Arc<dyn AuditStore>,
    /// Held across the inner write so sequence numbers are assigned in
    /// storage order and a failed write does not advance the tip.
    tips: Mutex<HashMap<String, Option<ChainTip>>>,
}

impl HashChainAuditStore {
    pub fn new(inner: Arc<dyn AuditStore>) -> Self {
        Self {
            inner,
            tips: Mutex::new(HashMap::new()),
        }
    }

    fn compute_record_hash(entry: &AuditEntry) -> String {
        let canonical = serde_json::json!({
            "id": entry.id,
            "event_type": entry.event_type,
            "timestamp": entry.timestamp.to_rfc3339(),
            "organization_id": entry.organization_id,
            "entity_type": entry.entity_type,
            "entity_id": entry.entity_id,
            "action": entry.action,
            "details": entry.details,
            "severity": entry.severity.as_str(),
            "actor_id": entry.actor_id,
            "previous_hash": entry.previous_hash,
            "sequence_number": entry.sequence_number,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn get_or_fetch_tip(
        &self,
        organization_id: &str,
        tips: &mut HashMap<String, Option<ChainTip>>,
    ) -> Result<Option<ChainTip>, AuditError> {
        if let Some(tip) = tips.get(organization_id) {
            return Ok(tip.clone());
        }

        let query = AuditQuery {
            organization_id: Some(organization_id.to_owned()),
            limit: Some(1),
            order: AuditOrder::SequenceDesc,
            ..AuditQuery::default()
        };
        let page = self.inner.query(&query).await?;
        let tip = page.entries.into_iter().next().and_then(|e| {
            e.record_hash.map(|hash| ChainTip {
                record_hash: hash,
                sequence_number: e.sequence_number.unwrap_or(0),
            })
        });

        tips.insert(organization_id.to_owned(), tip.clone());
        Ok(tip)
    }

    /// Re-compute every hash in the organization's chain and check the links.
    pub async fn verify_chain(
        &self,
        organization_id: &str,
    ) -> Result<HashChainVerification, AuditError> {
        let mut previous_hash: Option<String> = None;
        let mut first_broken_at: Option<String> = None;
        let mut first_entry_id: Option<String> = None;
        let mut last_entry_id: Option<String> = None;
        let mut checked = 0u64;
        let mut offset = 0u32;

        'pages: loop {
            let query = AuditQuery {
                organization_id: Some(organization_id.to_owned()),
                limit: Some(VERIFY_PAGE_SIZE),
                offset: Some(offset),
                order: AuditOrder::SequenceAsc,
                ..AuditQuery::default()
            };
            let page = self.inner.query(&query).await?;
            let fetched = page.entries.len();

            for entry in page.entries {
                checked += 1;
                if first_entry_id.is_none() {
                    first_entry_id = Some(entry.id.clone());
                }
                last_entry_id = Some(entry.id.clone());

                let expected = Self::compute_record_hash(&entry);
                let linked = entry.previous_hash == previous_hash;
                match entry.record_hash {
                    Some(hash) if linked && hash == expected => previous_hash = Some(hash),
                    _ => {
                        warn!(
                            organization_id,
                            entry_id = %entry.id,
                            "audit hash chain broken"
                        );
                        first_broken_at = Some(entry.id);
                        break 'pages;
                    }
                }
            }

            if fetched < VERIFY_PAGE_SIZE as usize {
                break;
            }
            offset = offset.saturating_add(VERIFY_PAGE_SIZE);
        }

        Ok(HashChainVerification {
            valid: first_broken_at.is_none(),
            entries_checked: checked,
            first_broken_at,
            first_entry_id,
            last_entry_id,
        })
    }
}

#[async_trait]
impl AuditStore for HashChainAuditStore {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut tips = self.tips.lock().await;
        let tip = self
            .get_or_fetch_tip(&entry.organization_id, &mut tips)
            .await?;

        let mut chained = entry;
        let (previous_hash, sequence_number) = match tip {
            Some(t) => (Some(t.record_hash), t.sequence_number + 1),
            None => (None, 0),
        };
        chained.previous_hash = previous_hash;
        chained.sequence_number = Some(sequence_number);
        let record_hash = Self::compute_record_hash(&chained);
        chained.record_hash = Some(record_hash.clone());

        let organization_id = chained.organization_id.clone();
        self.inner.record(chained).await?;

        tips.insert(
            organization_id,
            Some(ChainTip {
                record_hash,
                sequence_number,
            }),
        );
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<AuditEntry>, AuditError> {
        self.inner.get_by_id(id).await
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        self.inner.query(query).await
    }
}
