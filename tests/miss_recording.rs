//! Miss recording tests
//!
//! What gets written to the store after a miss, and what doesn't:
//! - failed compiles leave nothing behind
//! - unhashable dependencies produce a disabled manifest
//! - broken compiler contracts surface as fatal errors
//! - the preprocessor strategy keys on expanded source

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use objcache::cache::{MissReason, Outcome};
use objcache::manifest::{F_MANIFEST, F_OBJECT, F_PDB, F_STDERR, F_STDOUT};
use objcache::mock::{MockCompiler, RecordingSink};
use objcache::{
    CacheConfig, CacheError, CacheManifest, CompilerCache, CompilerIdentity, DataHashResult,
    IdentityConfig, Invocation, MissRecord, StatsSnapshot, StrategyKind,
};
use objcache_store::{CacheStore, FileCacheStore};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    cwd: PathBuf,
    cache_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let cwd = temp.path().join("src");
        let cache_dir = temp.path().join("cache");
        fs::create_dir_all(&cwd).unwrap();
        Self {
            _temp: temp,
            cwd,
            cache_dir,
        }
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.cwd.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn config(&self) -> CacheConfig {
        CacheConfig {
            cache_dir: self.cache_dir.clone(),
            lock_timeout_ms: 5_000,
            identity: IdentityConfig {
                compiler_identity: CompilerIdentity::Path,
                ..IdentityConfig::default()
            },
            ..CacheConfig::default()
        }
    }

    fn cache_with(&self, config: CacheConfig) -> (CompilerCache, Arc<RecordingSink>, FileCacheStore) {
        let sink = Arc::new(RecordingSink::new());
        let store = FileCacheStore::new(&config.cache_dir).unwrap();
        let cache = CompilerCache::with_parts(config, Arc::new(store.clone()), sink.clone());
        (cache, sink, store)
    }

    fn cache(&self) -> (CompilerCache, Arc<RecordingSink>, FileCacheStore) {
        self.cache_with(self.config())
    }

    fn compiler(&self) -> MockCompiler {
        MockCompiler::new(&self.cwd, "main.c")
    }
}

fn args() -> Vec<String> {
    vec!["-c".to_string(), "main.c".to_string()]
}

fn no_env() -> Vec<(String, String)> {
    Vec::new()
}

fn run(
    cache: &CompilerCache,
    cc: &mut dyn objcache::Compiler,
) -> (Invocation, String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let invocation = cache
        .process(cc, &args(), no_env(), &mut out, &mut err)
        .unwrap();
    (
        invocation,
        String::from_utf8(out).unwrap(),
        String::from_utf8(err).unwrap(),
    )
}

fn key_of(cache: &CompilerCache, cc: &dyn objcache::Compiler) -> String {
    cache
        .session_identity(cc, &args(), no_env())
        .unwrap()
        .session_hash
}

fn stored_manifest(store: &FileCacheStore, key: &str) -> CacheManifest {
    CacheManifest::from_reader(store.open_entry(key, F_MANIFEST).unwrap()).unwrap()
}

// === Failed compiles ===

#[test]
fn test_failed_compile_stores_nothing() {
    let fx = Fixture::new();
    fx.write("main.c", "#include \"missing.h\"\nint main;\n");
    let (cache, sink, store) = fx.cache();
    let mut cc = fx.compiler();

    let (invocation, _, err) = run(&cache, &mut cc);

    assert_eq!(invocation.exit_code, 1);
    assert_eq!(invocation.outcome, Outcome::Miss(MissReason::NoPreviousBuild));
    assert!(err.contains("missing.h"));
    assert!(store.list_keys().unwrap().is_empty());
    assert_eq!(sink.miss_reasons(), vec![DataHashResult::NoPreviousBuild]);
    assert_eq!(cache.stats().snapshot().cache_objects, 0);
}

#[test]
fn test_nonzero_exit_is_never_cached() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let (cache, _, store) = fx.cache();
    let mut cc = fx
        .compiler()
        .with_exit_code(2)
        .with_output("", "error: deliberately broken\n");

    let (first, _, err) = run(&cache, &mut cc);
    let (second, _, _) = run(&cache, &mut cc);

    assert_eq!(first.exit_code, 2);
    assert_eq!(second.exit_code, 2);
    assert_eq!(err, "error: deliberately broken\n");
    assert_eq!(cc.compile_count(), 2);
    assert!(store.list_keys().unwrap().is_empty());
}

// === Successful recording ===

#[test]
fn test_entry_layout() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let (cache, _, store) = fx.cache();
    let mut cc = fx
        .compiler()
        .with_pdb("main.pdb")
        .with_output("compiled\n", "");

    run(&cache, &mut cc);

    let key = key_of(&cache, &cc);
    let keys = store.list_keys().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key, key);
    assert_eq!(keys[0].entries, vec![F_MANIFEST, F_OBJECT, F_PDB, F_STDERR, F_STDOUT]);
    assert!(store
        .key_dir(&key)
        .starts_with(fx.cache_dir.join(&key[..2])));

    let manifest = stored_manifest(&store, &key);
    assert_eq!(manifest.exit_code, 0);
    assert!(manifest.pdb_hash.is_some());
    assert!(manifest.earlier_pdb_hash.is_none());
    assert!(!manifest.pp_mode());
    assert!(!manifest.timestamp.is_empty());

    let stats = cache.stats().snapshot();
    assert_eq!(stats.cache_objects, 1);
    assert!(stats.cache_size > 0);
}

#[test]
fn test_rebuild_records_earlier_debug_file() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    fx.write("main.pdb", "left over from a build before caching");
    let (cache, _, store) = fx.cache();
    let mut cc = fx.compiler().with_pdb("main.pdb");

    run(&cache, &mut cc);

    let manifest = stored_manifest(&store, &key_of(&cache, &cc));
    let earlier = objcache::Hasher::digest_bytes(b"left over from a build before caching");
    assert_eq!(manifest.earlier_pdb_hash, Some(earlier));
    assert_ne!(manifest.pdb_hash, manifest.earlier_pdb_hash);
}

#[test]
fn test_tracker_folder_requested() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let mut config = fx.config();
    config.tracker_mode = true;
    let (cache, _, _) = fx.cache_with(config);
    let mut cc = fx.compiler();

    run(&cache, &mut cc);

    let folder = cc.tracker().unwrap();
    assert!(folder.starts_with("objcache-track-"));
    assert_eq!(folder.len(), "objcache-track-".len() + 8);
}

#[test]
fn test_disabled_config_bypasses_cache() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let mut config = fx.config();
    config.disabled = true;
    let (cache, sink, store) = fx.cache_with(config);
    let mut cc = fx.compiler();

    let (first, _, _) = run(&cache, &mut cc);
    let (second, _, _) = run(&cache, &mut cc);

    assert_eq!(first.outcome, Outcome::Uncached);
    assert_eq!(second.outcome, Outcome::Uncached);
    assert_eq!(cc.compile_count(), 2);
    assert!(store.list_keys().unwrap().is_empty());
    assert!(sink.misses().is_empty());
}

// === Disabled manifests ===

#[test]
fn test_unhashable_dependency_writes_disabled_manifest() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let (cache, sink, store) = fx.cache();
    let gone_a = fx.cwd.join("generated_a.h");
    let gone_b = fx.cwd.join("generated_b.h");
    let mut cc = fx
        .compiler()
        .with_extra_read(&gone_a)
        .with_extra_read(&gone_b);

    let (invocation, _, _) = run(&cache, &mut cc);
    assert_eq!(invocation.exit_code, 0);

    let key = key_of(&cache, &cc);
    let manifest = stored_manifest(&store, &key);
    assert!(manifest.disable);
    assert!(manifest.include_files.is_empty());
    assert!(!store.contains_entry(&key, F_OBJECT));

    // Every failed hash is reported.
    let failed: Vec<MissRecord> = sink
        .misses()
        .into_iter()
        .filter(|m| m.reason == DataHashResult::FileMissing)
        .collect();
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[0].detail, gone_a.display().to_string());
    assert_eq!(failed[1].detail, gone_b.display().to_string());

    let (next, _, _) = run(&cache, &mut cc);
    assert_eq!(next.outcome, Outcome::Miss(MissReason::Disabled));
    assert_eq!(cc.compile_count(), 2);
}

// === Fatal and recoverable errors ===

#[test]
fn test_no_include_dirs_is_fatal() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let (cache, _, store) = fx.cache();
    let mut cc = fx.compiler().without_include_dirs();

    let mut out = Vec::new();
    let mut err = Vec::new();
    let result = cache.process(&mut cc, &args(), no_env(), &mut out, &mut err);

    match result {
        Err(e @ CacheError::NoIncludeDirs { .. }) => {
            assert!(!e.is_recoverable());
            assert_eq!(
                e.to_string(),
                "could not find any include folders [-c main.c]"
            );
        }
        other => panic!("expected NoIncludeDirs, got {:?}", other),
    }
    assert!(store.list_keys().unwrap().is_empty());
}

/// Reports every file it read as a potential include too.
struct OverlappingCompiler(MockCompiler);

impl objcache::Compiler for OverlappingCompiler {
    fn compiler_exe(&self) -> &Path {
        self.0.compiler_exe()
    }
    fn working_directory(&self) -> &Path {
        self.0.working_directory()
    }
    fn single_source_file(&self) -> &Path {
        self.0.single_source_file()
    }
    fn object_target(&self) -> &Path {
        self.0.object_target()
    }
    fn attempt_pdb(&self) -> bool {
        false
    }
    fn generate_pdb(&self) -> bool {
        false
    }
    fn pdb_file(&self) -> Option<&Path> {
        None
    }
    fn compile(
        &mut self,
        args: &[String],
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        files_read: &mut Vec<PathBuf>,
    ) -> io::Result<i32> {
        self.0.compile(args, stdout, stderr, files_read)
    }
    fn preprocess(&mut self, args: &[String], out: &mut dyn Write) -> io::Result<i32> {
        self.0.preprocess(args, out)
    }
    fn used_include_dirs(&self, files_read: &[PathBuf]) -> BTreeSet<PathBuf> {
        self.0.used_include_dirs(files_read)
    }
    fn potential_include_files(
        &self,
        _dirs: &BTreeSet<PathBuf>,
        files_read: &[PathBuf],
    ) -> Vec<PathBuf> {
        files_read.to_vec()
    }
}

#[test]
fn test_overlapping_dependencies_compile_uncached() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let (cache, _, store) = fx.cache();
    let mut cc = OverlappingCompiler(fx.compiler().with_output("once\n", ""));

    let (invocation, out, _) = run(&cache, &mut cc);

    assert_eq!(invocation.exit_code, 0);
    assert_eq!(out, "once\n", "abandoned compile output must not be shown");
    assert_eq!(cc.0.compile_count(), 2);
    assert!(store.list_keys().unwrap().is_empty());
}

#[test]
fn test_lock_timeout_compiles_uncached() {
    use objcache_store::{CacheLock, LockMode};
    use std::time::Duration;

    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let mut config = fx.config();
    config.lock_timeout_ms = 50;
    let (cache, _, store) = fx.cache_with(config);
    let mut cc = fx.compiler();

    let _writer =
        CacheLock::acquire(&fx.cache_dir, LockMode::ReadWrite, Duration::from_secs(1)).unwrap();
    let (invocation, _, _) = run(&cache, &mut cc);

    assert_eq!(invocation.outcome, Outcome::Uncached);
    assert_eq!(invocation.exit_code, 0);
    assert!(fx.cwd.join("main.o").exists());
    assert!(store.list_keys().unwrap().is_empty());
}

// === Preprocessor strategy ===

#[test]
fn test_preprocessor_strategy_keys_on_expanded_source() {
    let fx = Fixture::new();
    fx.write("main.c", "#include \"util.h\"\nint main;\n");
    fx.write("util.h", "int util_v1;\n");
    let mut config = fx.config();
    config.strategy = StrategyKind::Preprocessor;
    let (cache, sink, store) = fx.cache_with(config);
    let mut cc = fx.compiler();

    let (first, _, _) = run(&cache, &mut cc);
    assert_eq!(first.outcome, Outcome::Miss(MissReason::NoPreviousBuild));
    let keys = store.list_keys().unwrap();
    assert_eq!(keys.len(), 1);

    let manifest = stored_manifest(&store, &keys[0].key);
    assert!(manifest.pp_mode());
    assert!(manifest.include_files.is_empty());
    assert!(manifest.potential_new_includes.is_empty());
    assert_ne!(keys[0].key, key_of(&cache, &cc), "key folds in the preprocessed source");

    assert_eq!(run(&cache, &mut cc).0.outcome, Outcome::Hit);

    fx.write("util.h", "int util_v2;\n");
    let (changed, _, _) = run(&cache, &mut cc);
    assert_eq!(changed.outcome, Outcome::Miss(MissReason::NoPreviousBuild));
    assert_eq!(store.list_keys().unwrap().len(), 2);
    assert!(sink
        .messages()
        .iter()
        .any(|m| m == "preprocessor compiler cache"));
}

#[test]
fn test_preprocessor_failure_compiles_uncached() {
    let fx = Fixture::new();
    fx.write("main.c", "#include \"missing.h\"\n");
    let mut config = fx.config();
    config.strategy = StrategyKind::Preprocessor;
    let (cache, _, store) = fx.cache_with(config);
    let mut cc = fx.compiler();

    let (invocation, _, err) = run(&cache, &mut cc);

    assert_eq!(invocation.outcome, Outcome::Uncached);
    assert_eq!(invocation.exit_code, 1);
    assert!(err.contains("missing.h"));
    assert!(store.list_keys().unwrap().is_empty());
}

// === Diagnostics and stats ===

#[test]
fn test_miss_log_and_stats_persist() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let mut config = fx.config();
    let log = fx.cache_dir.join("misses.jsonl");
    config.miss_log = Some(log.clone());
    let cache = CompilerCache::open(config).unwrap();
    let mut cc = fx.compiler();

    run(&cache, &mut cc);
    run(&cache, &mut cc);

    let lines: Vec<MissRecord> = fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].reason, DataHashResult::NoPreviousBuild);
    assert_eq!(lines[0].identity, key_of(&cache, &cc));

    let totals = cache.flush_stats().unwrap();
    assert_eq!(totals.cache_hits, 1);
    assert_eq!(totals.cache_misses, 1);
    assert_eq!(StatsSnapshot::load(&fx.cache_dir), totals);
}

#[test]
fn test_process_persists_stats_without_flush() {
    let fx = Fixture::new();
    fx.write("main.c", "int main;\n");
    let (cache, _, _) = fx.cache();
    let mut cc = fx.compiler();

    run(&cache, &mut cc);
    let after_miss = StatsSnapshot::load(&fx.cache_dir);
    assert_eq!(after_miss.cache_misses, 1);
    assert_eq!(after_miss.cache_objects, 1);

    run(&cache, &mut cc);
    let after_hit = StatsSnapshot::load(&fx.cache_dir);
    assert_eq!(after_hit.cache_hits, 1);
    assert_eq!(after_hit.cache_misses, 1);
    assert_eq!(cache.stats().pending(), StatsSnapshot::default());

    // A second process sharing the cache adds to the same totals.
    let (other, _, _) = fx.cache();
    run(&other, &mut fx.compiler());
    assert_eq!(StatsSnapshot::load(&fx.cache_dir).cache_hits, 2);
}
