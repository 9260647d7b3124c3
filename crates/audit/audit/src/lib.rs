pub mod chain;
pub mod error;
pub mod record;
pub mod store;

pub use chain::{HashChainAuditStore, HashChainVerification};
pub use error::AuditError;
pub use record::{AuditEntry, AuditOrder, AuditPage, AuditQuery, AuditSeverity};
pub use store::AuditStore;
