//! objcache - compilation result cache
//!
//! Sits in front of a C/C++ compiler and replays stored object files,
//! debug-info files and compiler output when an invocation, and every file
//! it read, is unchanged since a previous build.

pub mod cache;
pub mod compiler;
pub mod config;
pub mod diag;
pub mod error;
pub mod hash;
pub mod identity;
pub mod manifest;
pub mod mock;
pub mod stats;

pub use cache::{
    CacheKey, CompilerCache, DirectCache, Invocation, Lookup, MissContext, MissHandler, MissReason,
    Outcome, PreprocessorCache, ReadGuard,
};
pub use compiler::Compiler;
pub use config::{CacheConfig, ConfigError, StrategyKind};
pub use diag::{DiagnosticSink, MissRecord, TracingSink};
pub use error::{CacheError, CacheResult};
pub use hash::{DataHash, DataHashResult, Hasher};
pub use identity::{CompilerIdentity, IdentityConfig, IdentityInputs, SessionIdentity};
pub use manifest::CacheManifest;
pub use stats::{CacheStats, StatsSnapshot};
