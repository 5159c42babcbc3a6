//! objcache storage layer
//!
//! Artifact storage and cache-wide locking for the objcache engine:
//! - [`FileCacheStore`]: key/name addressed blob store on the filesystem
//! - [`CacheLock`]: shared/exclusive advisory lock over the cache root

mod lock;
mod store;

pub use lock::{CacheLock, LockError, LockMode, LockResult};
pub use store::{CacheStore, FileCacheStore, KeyInfo, StoreError, StoreResult};
