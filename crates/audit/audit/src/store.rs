use async_trait::async_trait;

use crate::error::AuditError;
use crate::record::{AuditEntry, AuditPage, AuditQuery};

/// Trait for append-only audit storage backends.
///
/// Entries cannot be updated or deleted through this trait.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist an entry. Callers treat a failure here as fatal for the
    /// operation being audited.
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<AuditEntry>, AuditError>;

    /// Query entries with filters and pagination.
    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError>;
}
