//! Miss handling strategies.
//!
//! - [`DirectCache`]: keyed on the raw invocation; the manifest tracks every
//!   file read plus the include paths that were searched for and missing.
//! - [`PreprocessorCache`]: keyed on the preprocessed source text; the
//!   preprocessor has already resolved every include, so the manifest
//!   carries no dependency list.

use std::io::Write;

use crate::compiler::Compiler;
use crate::error::{CacheError, CacheResult};
use crate::hash::Hasher;
use crate::identity::SessionIdentity;

use super::record::RecordMode;
use super::{CacheKey, CompilerCache, ReadGuard};

/// Everything a miss handler needs to compile and record one invocation.
pub struct MissContext<'a> {
    pub compiler: &'a mut dyn Compiler,
    pub args: &'a [String],
    pub key: &'a CacheKey,
    /// Shared cache lock, still held from `check_cache`.
    pub guard: ReadGuard,
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
}

/// Strategy hook invoked when a lookup misses.
pub trait MissHandler: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str {
        "custom"
    }

    /// Turn the session identity into the key entries are stored under.
    fn cache_key(
        &self,
        _cache: &CompilerCache,
        _compiler: &mut dyn Compiler,
        _args: &[String],
        session: SessionIdentity,
    ) -> CacheResult<CacheKey> {
        Ok(CacheKey::direct(session))
    }

    /// Compile and record. Called with the shared lock held in `ctx.guard`;
    /// the handler owns releasing it and must take the exclusive lock
    /// separately before writing.
    fn on_cache_miss(&self, cache: &CompilerCache, ctx: MissContext<'_>) -> CacheResult<i32>;
}

/// Direct mode: include tracking.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectCache;

impl MissHandler for DirectCache {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn on_cache_miss(&self, cache: &CompilerCache, ctx: MissContext<'_>) -> CacheResult<i32> {
        cache.record_miss(ctx, RecordMode::Direct)
    }
}

/// Preprocessor mode: key on expanded source.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreprocessorCache;

impl MissHandler for PreprocessorCache {
    fn name(&self) -> &'static str {
        "preprocessor"
    }

    fn cache_key(
        &self,
        cache: &CompilerCache,
        compiler: &mut dyn Compiler,
        args: &[String],
        session: SessionIdentity,
    ) -> CacheResult<CacheKey> {
        let mut expanded = Vec::new();
        let exit_code = compiler
            .preprocess(args, &mut expanded)
            .map_err(|e| CacheError::Warning(format!("preprocessor failed to run: {}", e)))?;
        if exit_code != 0 {
            return Err(CacheError::Warning(format!(
                "preprocessor exited with {}",
                exit_code
            )));
        }

        let pp_hash = Hasher::digest_bytes(&expanded);
        cache
            .sink()
            .emit(&format!("preprocessed source hash {}", pp_hash));

        Ok(CacheKey {
            identity: session.derive(&pp_hash),
            preprocessed_hash: Some(pp_hash),
        })
    }

    fn on_cache_miss(&self, cache: &CompilerCache, ctx: MissContext<'_>) -> CacheResult<i32> {
        cache.record_miss(ctx, RecordMode::Preprocessed)
    }
}
