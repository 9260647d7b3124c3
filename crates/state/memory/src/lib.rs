pub mod lock;
pub mod retry;
pub mod store;

pub use lock::{MemoryDistributedLock, MemoryLockGuard};
pub use retry::MemoryRetryStore;
pub use store::MemoryStateStore;
