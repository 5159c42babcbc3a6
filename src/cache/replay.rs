use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use crate::compiler::{resolve, Compiler};
use crate::error::CacheResult;
use crate::manifest::{CacheManifest, F_OBJECT, F_PDB, F_STDERR, F_STDOUT};

use super::{CacheKey, CompilerCache};

impl CompilerCache {
    /// Serve a hit: restore the stored outputs where the compiler would
    /// have written them and replay its captured output. Caller holds the
    /// shared lock.
    pub(super) fn replay_hit(
        &self,
        compiler: &dyn Compiler,
        key: &CacheKey,
        manifest: &CacheManifest,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> CacheResult<i32> {
        let hash = key.hash();
        let cwd = compiler.working_directory();

        self.copy_out(hash, F_OBJECT, &resolve(cwd, compiler.object_target()))?;

        if compiler.generate_pdb() && self.store.contains_entry(hash, F_PDB) {
            if let Some(pdb) = compiler.pdb_file() {
                self.copy_out(hash, F_PDB, &resolve(cwd, pdb))?;
            }
        }

        if self.store.contains_entry(hash, F_STDOUT) {
            io::copy(&mut self.store.open_entry(hash, F_STDOUT)?, stdout)?;
        }
        if self.store.contains_entry(hash, F_STDERR) {
            io::copy(&mut self.store.open_entry(hash, F_STDERR)?, stderr)?;
        }

        self.stats.record_hit();
        Ok(manifest.exit_code)
    }

    fn copy_out(&self, hash: &str, name: &str, target: &Path) -> CacheResult<u64> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut reader = self.store.open_entry(hash, name)?;
        let mut file = File::create(target)?;
        Ok(io::copy(&mut reader, &mut file)?)
    }
}
