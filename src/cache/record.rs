//! Miss path: compile, build the manifest, store the entry.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::compiler::{resolve, Compiler};
use crate::error::{CacheError, CacheResult};
use crate::manifest::{CacheManifest, F_MANIFEST, F_OBJECT, F_PDB, F_STDERR, F_STDOUT};

use super::strategy::MissContext;
use super::{CacheKey, CompilerCache, MissReason, ReadGuard};

/// How the manifest of a new entry describes its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordMode {
    /// Every file read plus the potential includes.
    Direct,
    /// The preprocessed source hash only.
    Preprocessed,
}

/// Output of one compile, held back until the entry is recorded.
struct CapturedCompile {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    files_read: Vec<PathBuf>,
    duration: Duration,
}

impl CapturedCompile {
    fn write_to(&self, stdout: &mut dyn Write, stderr: &mut dyn Write) -> CacheResult<()> {
        stdout.write_all(&self.stdout)?;
        stderr.write_all(&self.stderr)?;
        Ok(())
    }
}

fn tracker_folder_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("objcache-track-{}", &id[..8])
}

impl CompilerCache {
    /// Compile a missed invocation and record it.
    ///
    /// Takes ownership of the shared lock in `ctx.guard`. A failed compile
    /// leaves the store untouched.
    pub(crate) fn record_miss(&self, ctx: MissContext<'_>, mode: RecordMode) -> CacheResult<i32> {
        let MissContext {
            compiler,
            args,
            key,
            guard,
            stdout,
            stderr,
        } = ctx;

        self.sink.emit("cache miss");
        self.stats.record_miss();

        let earlier_pdb_hash = self.earlier_pdb_hash(&*compiler);
        if self.config.tracker_mode {
            compiler.enable_tracker(&tracker_folder_name());
        }

        let compiled = Self::compile_captured(compiler, args)?;
        if compiled.exit_code != 0 {
            guard.release();
            self.sink
                .emit(&format!("compiler exited with {}, not caching", compiled.exit_code));
            compiled.write_to(stdout, stderr)?;
            return Ok(compiled.exit_code);
        }

        let recorded = self.do_cache_miss(&*compiler, args, key, guard, &compiled, earlier_pdb_hash, mode);
        match recorded {
            Ok(()) => {}
            Err(CacheError::Warning(why)) => {
                warn!(identity = %key.identity, %why, "not caching, compiling again uncached");
                return self.compile_only(compiler, args, stdout, stderr);
            }
            Err(e @ CacheError::NoIncludeDirs { .. }) => {
                compiled.write_to(stdout, stderr)?;
                return Err(e);
            }
            Err(e) => {
                warn!(identity = %key.identity, error = %e, "failed to record cache entry");
            }
        }

        compiled.write_to(stdout, stderr)?;
        Ok(compiled.exit_code)
    }

    fn compile_captured(compiler: &mut dyn Compiler, args: &[String]) -> CacheResult<CapturedCompile> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut files_read = Vec::new();

        let start = Instant::now();
        let exit_code = compiler
            .compile(args, &mut stdout, &mut stderr, &mut files_read)
            .map_err(CacheError::Compiler)?;

        Ok(CapturedCompile {
            exit_code,
            stdout,
            stderr,
            files_read,
            duration: start.elapsed(),
        })
    }

    /// Hash of a debug file left behind by an earlier build, if any.
    fn earlier_pdb_hash(&self, compiler: &dyn Compiler) -> Option<String> {
        if !compiler.attempt_pdb() || !compiler.pdb_exists_already() {
            return None;
        }
        let pdb = resolve(compiler.working_directory(), compiler.pdb_file()?);
        let hash = self.hasher.digest_file(&pdb);
        hash.is_ok().then_some(hash.hash)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_cache_miss(
        &self,
        compiler: &dyn Compiler,
        args: &[String],
        key: &CacheKey,
        guard: ReadGuard,
        compiled: &CapturedCompile,
        earlier_pdb_hash: Option<String>,
        mode: RecordMode,
    ) -> CacheResult<()> {
        // Dependencies are hashed while the shared lock is still held.
        let built = self.build_manifest(compiler, args, key, compiled, mode);
        guard.release();

        let mut manifest = built?;
        manifest.earlier_pdb_hash = earlier_pdb_hash;
        manifest.exit_code = compiled.exit_code;
        manifest.duration_ms = compiled.duration.as_millis() as u64;

        let _write = self.write_lock()?;
        if manifest.disable {
            self.store.remove(key.hash())?;
            self.store
                .write_entry(key.hash(), F_MANIFEST, &manifest.to_json()?)?;
            self.sink
                .emit(&format!("stored disabled manifest for {}", key.hash()));
            return Ok(());
        }
        self.save_outputs_locked(compiler, compiled, &mut manifest)
    }

    fn build_manifest(
        &self,
        compiler: &dyn Compiler,
        args: &[String],
        key: &CacheKey,
        compiled: &CapturedCompile,
        mode: RecordMode,
    ) -> CacheResult<CacheManifest> {
        let mut manifest = CacheManifest::new(key.hash());

        if mode == RecordMode::Preprocessed {
            let pp_hash = key.preprocessed_hash.clone().ok_or_else(|| {
                CacheError::Warning("preprocessed key without a source hash".to_string())
            })?;
            manifest.preprocessed_source_hash = Some(pp_hash);
            return Ok(manifest);
        }

        let files_read = &compiled.files_read;
        let include_dirs = compiler.used_include_dirs(files_read);
        if include_dirs.is_empty() {
            return Err(CacheError::NoIncludeDirs {
                args: args.join(" "),
            });
        }
        manifest.potential_new_includes = compiler.potential_include_files(&include_dirs, files_read);

        let cwd = compiler.working_directory();
        for (path, hashed) in self.get_hashes(cwd, files_read) {
            if hashed.is_ok() {
                manifest.include_files.insert(path, hashed.hash);
                continue;
            }
            self.sink.emit(&format!(
                "hashing {} failed: {}",
                path.display(),
                hashed.result
            ));
            self.report_miss(
                key.hash(),
                compiler,
                &MissReason::HashFailed {
                    path,
                    result: hashed.result,
                },
            );
            manifest.disable = true;
        }

        if manifest.disable {
            manifest.include_files.clear();
            manifest.potential_new_includes.clear();
            return Ok(manifest);
        }

        if let Some(path) = manifest.overlapping_paths().first() {
            return Err(CacheError::Warning(format!(
                "{} is both a dependency and a potential include",
                path.display()
            )));
        }

        Ok(manifest)
    }

    /// Replace the entry for `manifest.session_hash`. Caller holds the
    /// exclusive lock. The manifest is written last so a torn entry reads
    /// as absent.
    fn save_outputs_locked(
        &self,
        compiler: &dyn Compiler,
        compiled: &CapturedCompile,
        manifest: &mut CacheManifest,
    ) -> CacheResult<()> {
        let key = manifest.session_hash.clone();
        let cwd = compiler.working_directory();

        let object = resolve(cwd, compiler.object_target());
        if !object.is_file() {
            return Err(CacheError::Warning(format!(
                "compiler left no object file at {}",
                object.display()
            )));
        }

        self.store.remove(&key)?;
        self.store.ensure_key(&key)?;
        let object_bytes = self.store.add_file(&key, &object, F_OBJECT)?;

        if compiler.generate_pdb() {
            if let Some(pdb) = compiler.pdb_file() {
                let pdb = resolve(cwd, pdb);
                let hashed = self.hasher.digest_file(&pdb);
                if hashed.is_ok() {
                    let pdb_bytes = self.store.add_file(&key, &pdb, F_PDB)?;
                    self.stats.record_bytes(pdb_bytes);
                    manifest.pdb_hash = Some(hashed.hash);
                } else {
                    self.sink
                        .emit(&format!("debug file {} not produced", pdb.display()));
                }
            }
        }

        self.store.write_entry(&key, F_STDOUT, &compiled.stdout)?;
        self.store.write_entry(&key, F_STDERR, &compiled.stderr)?;
        self.stats.record_object(object_bytes);

        self.sink
            .emit(&format!("cache miss took {}ms", manifest.duration_ms));
        self.store.write_entry(&key, F_MANIFEST, &manifest.to_json()?)?;
        Ok(())
    }
}
