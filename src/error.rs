//! Error taxonomy for the cache engine.
//!
//! Expected misses are not errors at all; they come back as
//! [`Lookup::Miss`](crate::cache::Lookup). What remains here splits into
//! recoverable conditions, which send the caller down the uncached
//! compile-only path, and fatal ones, which propagate.

use std::io;

use objcache_store::{LockError, StoreError};
use thiserror::Error;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("identity error: {0}")]
    Identity(String),

    /// Unexpected but harmless state; abandon caching for this invocation.
    #[error("cache warning: {0}")]
    Warning(String),

    /// The compiler itself could not be run.
    #[error("compiler invocation failed: {0}")]
    Compiler(#[source] io::Error),

    /// The compiler read files but reported no include directories.
    #[error("could not find any include folders [{args}]")]
    NoIncludeDirs { args: String },
}

impl CacheError {
    /// Whether the caller should fall back to an uncached compile.
    ///
    /// Everything the cache layer raises about its own state is recoverable.
    /// A broken compiler contract or a compiler that can't be started is not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NoIncludeDirs { .. } | Self::Compiler(_))
    }
}
