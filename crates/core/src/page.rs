use serde::{Deserialize, Serialize};

/// Default page size when a query sets no limit.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// Largest page a query may request.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Clamp an optional limit to `1..=MAX_PAGE_LIMIT`, defaulting to 50.
#[must_use]
pub fn effective_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

/// A paginated slice of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total matches before pagination.
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

impl<T> Page<T> {
    /// Paginate an already filtered and sorted list.
    #[must_use]
    pub fn from_sorted(all: Vec<T>, limit: Option<u32>, offset: Option<u32>) -> Self {
        let limit = effective_limit(limit);
        let offset = offset.unwrap_or(0);
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Self {
            items,
            total,
            limit,
            offset,
        }
    }
}
