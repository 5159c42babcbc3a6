//! Hit/miss validation of a stored entry against the filesystem.

use crate::compiler::{resolve, Compiler};
use crate::error::CacheError;
use crate::manifest::{CacheManifest, F_MANIFEST, F_OBJECT};

use super::{CacheKey, CompilerCache, MissReason};

/// Validation result before it is reported and acted on.
pub(super) enum Verdict {
    Hit(CacheManifest),
    Miss {
        reason: MissReason,
        manifest: Option<CacheManifest>,
        /// Remove the stored entry before anyone else reads it.
        evict: bool,
    },
}

impl Verdict {
    fn miss(reason: MissReason, manifest: Option<CacheManifest>) -> Self {
        Self::Miss {
            reason,
            manifest,
            evict: false,
        }
    }

    fn evict(reason: MissReason, manifest: Option<CacheManifest>) -> Self {
        Self::Miss {
            reason,
            manifest,
            evict: true,
        }
    }
}

impl CompilerCache {
    /// Caller holds the shared lock.
    pub(super) fn validate(&self, compiler: &dyn Compiler, key: &CacheKey) -> Verdict {
        let hash = key.hash();

        if !self.store.contains_entry(hash, F_MANIFEST) {
            return Verdict::miss(MissReason::NoPreviousBuild, None);
        }

        let manifest = match self
            .store
            .open_entry(hash, F_MANIFEST)
            .map_err(CacheError::from)
            .and_then(CacheManifest::from_reader)
        {
            Ok(m) => m,
            Err(e) => return Verdict::evict(MissReason::CorruptManifest(e.to_string()), None),
        };

        if manifest.session_hash != hash {
            let why = format!("manifest belongs to {}", manifest.session_hash);
            return Verdict::evict(MissReason::CorruptManifest(why), Some(manifest));
        }

        // Nothing else in a disabled manifest can be trusted.
        if manifest.disable {
            self.sink.emit("disabled by manifest");
            return Verdict::miss(MissReason::Disabled, Some(manifest));
        }

        let cwd = compiler.working_directory();

        let appeared = manifest
            .potential_new_includes
            .iter()
            .find(|p| resolve(cwd, p).exists())
            .cloned();
        if let Some(path) = appeared {
            self.sink
                .emit(&format!("detected added include file {}", path.display()));
            return Verdict::miss(MissReason::FileAdded(path), Some(manifest));
        }

        if manifest.pp_mode() && manifest.preprocessed_source_hash != key.preprocessed_hash {
            let reason = MissReason::FileChanged(compiler.single_source_file().to_path_buf());
            return Verdict::miss(reason, Some(manifest));
        }

        let hashes = self.get_hashes(cwd, manifest.include_files.keys());
        for (path, current) in &hashes {
            if !current.is_ok() {
                self.sink.emit(&format!(
                    "include file hash error {} {}",
                    path.display(),
                    current.result
                ));
                let reason = MissReason::HashFailed {
                    path: path.clone(),
                    result: current.result,
                };
                return Verdict::miss(reason, Some(manifest));
            }
            let stale = match manifest.include_files.get(path) {
                Some(recorded) if *recorded == current.hash => None,
                Some(_) => Some(MissReason::FileChanged(path.clone())),
                None => Some(MissReason::FileAdded(path.clone())),
            };
            if let Some(reason) = stale {
                self.sink.emit(&format!("include file {} {}", reason.status(), path.display()));
                return Verdict::miss(reason, Some(manifest));
            }
        }

        if compiler.attempt_pdb() && compiler.pdb_exists_already() {
            if let Some(pdb) = compiler.pdb_file() {
                let current = self.hasher.digest_file(&resolve(cwd, pdb));
                let known = current.is_ok()
                    && [&manifest.earlier_pdb_hash, &manifest.pdb_hash]
                        .iter()
                        .any(|h| h.as_deref() == Some(current.hash.as_str()));
                if !known {
                    self.sink
                        .emit(&format!("debug file {} changed outside the cache", pdb.display()));
                    let reason = MissReason::PdbChanged(pdb.to_path_buf());
                    return Verdict::evict(reason, Some(manifest));
                }
            }
        }

        for name in [F_MANIFEST, F_OBJECT] {
            if !self.store.contains_entry(hash, name) {
                return Verdict::evict(MissReason::MissingArtifact(name), Some(manifest));
            }
        }

        Verdict::Hit(manifest)
    }
}
