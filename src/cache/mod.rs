//! Cache coordinator
//!
//! [`CompilerCache`] ties the store, the lock, the hasher and a
//! [`MissHandler`] strategy together. One call to [`CompilerCache::process`]
//! handles one compiler invocation:
//!
//! 1. compute the session identity (the cache key)
//! 2. [`check_cache`](CompilerCache::check_cache) under the shared lock
//! 3. hit: replay stored artifacts; miss: hand the still-held shared lock to
//!    the miss handler, which compiles and records the entry
//!
//! ## Locking
//!
//! `check_cache` returns its [`ReadGuard`] to the caller. The shared lock
//! stays held while the manifest is used and is released when the guard is
//! dropped or [released](ReadGuard::release). Writers release the shared
//! lock and take the exclusive one as a separate step; see
//! [`objcache_store::CacheLock`] for the race this admits.

mod record;
mod replay;
mod strategy;
mod validate;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use objcache_store::{CacheLock, CacheStore, FileCacheStore, LockMode};
use tracing::{info, warn};

use crate::compiler::{resolve, Compiler};
use crate::config::{CacheConfig, StrategyKind};
use crate::diag::{DiagnosticSink, MissRecord, TracingSink};
use crate::error::{CacheError, CacheResult};
use crate::hash::{DataHash, DataHashResult, Hasher};
use crate::identity::{IdentityInputs, SessionIdentity};
use crate::manifest::CacheManifest;
use crate::stats::{CacheStats, StatsSnapshot};

pub use strategy::{DirectCache, MissContext, MissHandler, PreprocessorCache};

/// Key of one lookup: the identity plus, in preprocessor mode, the hash of
/// the preprocessed source it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub identity: SessionIdentity,
    pub preprocessed_hash: Option<String>,
}

impl CacheKey {
    pub fn direct(identity: SessionIdentity) -> Self {
        Self {
            identity,
            preprocessed_hash: None,
        }
    }

    pub fn hash(&self) -> &str {
        self.identity.as_str()
    }
}

/// Why a lookup missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// No manifest stored under this key.
    NoPreviousBuild,
    /// The stored manifest is poisoned.
    Disabled,
    /// The stored manifest could not be read or belongs to another key.
    CorruptManifest(String),
    /// A previously absent include now exists, or a file is new.
    FileAdded(PathBuf),
    /// A recorded dependency has different content.
    FileChanged(PathBuf),
    /// A recorded dependency could not be hashed.
    HashFailed { path: PathBuf, result: DataHashResult },
    /// An existing debug-info file doesn't match the recorded build.
    PdbChanged(PathBuf),
    /// A required artifact is missing from the store.
    MissingArtifact(&'static str),
}

impl MissReason {
    /// Status code reported on the miss channel.
    pub fn status(&self) -> DataHashResult {
        match self {
            Self::NoPreviousBuild => DataHashResult::NoPreviousBuild,
            Self::Disabled | Self::CorruptManifest(_) | Self::MissingArtifact(_) => {
                DataHashResult::CacheCorrupt
            }
            Self::FileAdded(_) => DataHashResult::FileAdded,
            Self::FileChanged(_) | Self::PdbChanged(_) => DataHashResult::FileChanged,
            Self::HashFailed { result, .. } => *result,
        }
    }

    /// Offending path or short explanation.
    pub fn detail(&self) -> String {
        match self {
            Self::NoPreviousBuild => String::new(),
            Self::Disabled => "disabled by manifest".to_string(),
            Self::CorruptManifest(why) => why.clone(),
            Self::FileAdded(p) | Self::FileChanged(p) | Self::PdbChanged(p) => {
                p.display().to_string()
            }
            Self::HashFailed { path, .. } => path.display().to_string(),
            Self::MissingArtifact(name) => format!("missing {}", name),
        }
    }
}

/// Result of [`CompilerCache::check_cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheManifest),
    Miss {
        reason: MissReason,
        /// The stored manifest, when one was readable.
        manifest: Option<CacheManifest>,
    },
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// How an invocation was served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss(MissReason),
    /// The cache was bypassed or gave up; the compiler ran uncached.
    Uncached,
}

/// Result of [`CompilerCache::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub exit_code: i32,
    pub outcome: Outcome,
}

/// Shared cache lock held across the return of `check_cache`.
#[derive(Debug)]
#[must_use = "dropping the guard releases the shared cache lock"]
pub struct ReadGuard {
    lock: CacheLock,
}

impl ReadGuard {
    /// Release the shared lock now.
    pub fn release(self) {
        drop(self.lock);
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }
}

/// The cache coordinator.
pub struct CompilerCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    hasher: Hasher,
    stats: CacheStats,
    sink: Arc<dyn DiagnosticSink>,
    handler: Box<dyn MissHandler>,
}

impl std::fmt::Debug for CompilerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerCache")
            .field("cache_dir", &self.config.cache_dir)
            .field("strategy", &self.handler.name())
            .finish()
    }
}

impl CompilerCache {
    /// Open the cache described by `config` with the default store and sink.
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        let store = Arc::new(FileCacheStore::new(&config.cache_dir)?);
        let sink = Arc::new(TracingSink::new(config.miss_log.clone()));
        Ok(Self::with_parts(config, store, sink))
    }

    /// Assemble a cache from explicit parts. The strategy follows `config`.
    pub fn with_parts(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let handler: Box<dyn MissHandler> = match config.strategy {
            StrategyKind::Direct => Box::new(DirectCache),
            StrategyKind::Preprocessor => Box::new(PreprocessorCache),
        };
        sink.emit(&format!("{} compiler cache", handler.name()));
        Self {
            config,
            store,
            hasher: Hasher::new(),
            stats: CacheStats::new(),
            sink,
            handler,
        }
    }

    /// Replace the miss handler.
    pub fn with_handler(mut self, handler: Box<dyn MissHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn sink(&self) -> &dyn DiagnosticSink {
        self.sink.as_ref()
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    /// Fold this process's counters into the persisted totals.
    pub fn flush_stats(&self) -> CacheResult<StatsSnapshot> {
        self.stats.flush(self.store.root(), self.config.lock_timeout())
    }

    fn lock(&self, mode: LockMode) -> CacheResult<CacheLock> {
        Ok(CacheLock::acquire(
            self.store.root(),
            mode,
            self.config.lock_timeout(),
        )?)
    }

    /// Take the shared cache lock.
    pub fn read_lock(&self) -> CacheResult<ReadGuard> {
        Ok(ReadGuard {
            lock: self.lock(LockMode::Read)?,
        })
    }

    /// Take the exclusive cache lock.
    pub fn write_lock(&self) -> CacheResult<CacheLock> {
        self.lock(LockMode::ReadWrite)
    }

    /// Hash a batch of files, resolving relative paths against `cwd`.
    ///
    /// Results are keyed by the paths as given.
    pub fn get_hashes<'a, I>(&self, cwd: &Path, paths: I) -> BTreeMap<PathBuf, DataHash>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        paths
            .into_iter()
            .map(|p| (p.clone(), self.hasher.digest_file(&resolve(cwd, p))))
            .collect()
    }

    /// Compute the session identity of an invocation.
    pub fn session_identity<I, K, V>(
        &self,
        compiler: &dyn Compiler,
        args: &[String],
        env: I,
    ) -> CacheResult<SessionIdentity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        IdentityInputs::gather(
            &self.config.identity,
            &self.hasher,
            compiler.compiler_exe(),
            env,
            compiler.working_directory(),
            args,
        )?
        .compute()
    }

    /// Decide hit or miss for `key`.
    ///
    /// The shared lock is held on return in both cases. Entries found stale
    /// or corrupt are evicted under the exclusive lock before the shared
    /// lock is re-taken.
    pub fn check_cache(
        &self,
        compiler: &dyn Compiler,
        key: &CacheKey,
    ) -> CacheResult<(Lookup, ReadGuard)> {
        let guard = self.read_lock()?;

        match self.validate(compiler, key) {
            validate::Verdict::Hit(manifest) => {
                info!(
                    identity = %key.identity,
                    dir = %compiler.working_directory().display(),
                    src = %compiler.single_source_file().display(),
                    "cache hit"
                );
                Ok((Lookup::Hit(manifest), guard))
            }
            validate::Verdict::Miss {
                reason,
                manifest,
                evict,
            } => {
                self.report_miss(key.hash(), compiler, &reason);
                let guard = if evict {
                    guard.release();
                    self.evict(key.hash())?;
                    self.read_lock()?
                } else {
                    guard
                };
                Ok((Lookup::Miss { reason, manifest }, guard))
            }
        }
    }

    /// Remove every artifact stored under `hash`.
    pub fn evict(&self, hash: &str) -> CacheResult<bool> {
        let _write = self.write_lock()?;
        let removed = self.store.remove(hash)?;
        if removed {
            self.sink.emit(&format!("evicted cache entry {}", hash));
        }
        Ok(removed)
    }

    pub(crate) fn report_miss(&self, hash: &str, compiler: &dyn Compiler, reason: &MissReason) {
        self.sink.miss(&MissRecord::new(
            hash,
            reason.status(),
            compiler.working_directory(),
            compiler.single_source_file(),
            reason.detail(),
        ));
    }

    /// Run the compiler without touching the cache.
    pub fn compile_only(
        &self,
        compiler: &mut dyn Compiler,
        args: &[String],
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> CacheResult<i32> {
        let mut files_read = Vec::new();
        compiler
            .compile(args, stdout, stderr, &mut files_read)
            .map_err(CacheError::Compiler)
    }

    /// Serve one compiler invocation through the cache.
    ///
    /// Recoverable cache errors fall back to an uncached compile; only a
    /// broken compiler contract or a compiler that can't run surfaces as an
    /// error.
    pub fn process<I, K, V>(
        &self,
        compiler: &mut dyn Compiler,
        args: &[String],
        env: I,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> CacheResult<Invocation>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if self.config.disabled {
            let exit_code = self.compile_only(compiler, args, stdout, stderr)?;
            return Ok(Invocation {
                exit_code,
                outcome: Outcome::Uncached,
            });
        }

        let result = match self.process_cached(compiler, args, env, stdout, stderr) {
            Ok(invocation) => Ok(invocation),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "cache unavailable, compiling without it");
                self.compile_only(compiler, args, stdout, stderr)
                    .map(|exit_code| Invocation {
                        exit_code,
                        outcome: Outcome::Uncached,
                    })
            }
            Err(e) => Err(e),
        };
        self.persist_stats();
        result
    }

    /// Best-effort flush after an invocation; counters stay pending on failure.
    fn persist_stats(&self) {
        if self.stats.pending() == StatsSnapshot::default() {
            return;
        }
        if let Err(e) = self.flush_stats() {
            warn!(error = %e, "failed to persist cache statistics");
        }
    }

    fn process_cached<I, K, V>(
        &self,
        compiler: &mut dyn Compiler,
        args: &[String],
        env: I,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> CacheResult<Invocation>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let session = self.session_identity(&*compiler, args, env)?;
        let key = self.handler.cache_key(self, compiler, args, session)?;

        let (lookup, guard) = self.check_cache(&*compiler, &key)?;
        match lookup {
            Lookup::Hit(manifest) => {
                let exit_code = self.replay_hit(&*compiler, &key, &manifest, stdout, stderr)?;
                guard.release();
                Ok(Invocation {
                    exit_code,
                    outcome: Outcome::Hit,
                })
            }
            Lookup::Miss { reason, .. } => {
                let exit_code = self.handler.on_cache_miss(
                    self,
                    MissContext {
                        compiler,
                        args,
                        key: &key,
                        guard,
                        stdout,
                        stderr,
                    },
                )?;
                Ok(Invocation {
                    exit_code,
                    outcome: Outcome::Miss(reason),
                })
            }
        }
    }
}
