//! Compiler collaborator interface.
//!
//! The cache never starts a compiler process or parses compiler flags
//! itself. A [`Compiler`] wraps one parsed invocation and answers the
//! questions the cache needs: where outputs go, which files were read, and
//! which include directories were searched.

pub mod include;

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One parsed compiler invocation.
pub trait Compiler: Send {
    /// Path of the compiler executable.
    fn compiler_exe(&self) -> &Path;

    /// Directory the compiler runs in. Relative paths resolve against it.
    fn working_directory(&self) -> &Path;

    /// The translation unit being compiled.
    fn single_source_file(&self) -> &Path;

    /// Where the object file is written.
    fn object_target(&self) -> &Path;

    /// Whether debug info is requested by the arguments.
    fn attempt_pdb(&self) -> bool;

    /// Whether this invocation writes a separate debug-info file.
    fn generate_pdb(&self) -> bool;

    /// Path of the debug-info file, if any.
    fn pdb_file(&self) -> Option<&Path>;

    /// Whether a debug-info file is already present from an earlier run.
    fn pdb_exists_already(&self) -> bool {
        self.pdb_file().is_some_and(Path::exists)
    }

    /// Run the real compiler. Every file it reads is appended to `files_read`.
    fn compile(
        &mut self,
        args: &[String],
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        files_read: &mut Vec<PathBuf>,
    ) -> io::Result<i32>;

    /// Run only the preprocessor, writing the expanded source to `out`.
    fn preprocess(&mut self, args: &[String], out: &mut dyn Write) -> io::Result<i32>;

    /// Include directories that resolved at least one of `files_read`.
    fn used_include_dirs(&self, files_read: &[PathBuf]) -> BTreeSet<PathBuf>;

    /// Header paths searched for in `dirs` and not found.
    fn potential_include_files(
        &self,
        dirs: &BTreeSet<PathBuf>,
        files_read: &[PathBuf],
    ) -> Vec<PathBuf>;

    /// Ask the compiler to record file accesses into `folder_name`.
    fn enable_tracker(&mut self, _folder_name: &str) {}
}

/// Resolve `path` against `cwd` unless it is already absolute.
pub fn resolve(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
