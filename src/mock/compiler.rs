//! Mock compiler.
//!
//! Follows `#include "name"` lines through its search path, reads every
//! file it resolves and writes an object whose content is a digest of
//! everything read. A missing header fails the compile the way a real
//! compiler would.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crate::compiler::{include, resolve, Compiler};
use crate::hash::Hasher;

#[derive(Debug, Clone)]
pub struct MockCompiler {
    exe: PathBuf,
    cwd: PathBuf,
    source: PathBuf,
    object: PathBuf,
    pdb: Option<PathBuf>,
    search_path: Vec<PathBuf>,
    extra_reads: Vec<PathBuf>,
    exit_code: i32,
    stdout: String,
    stderr: String,
    report_include_dirs: bool,
    barrier: Option<Arc<Barrier>>,
    compiles: Arc<AtomicUsize>,
    tracker: Option<String>,
}

/// Files reached from the source, in the order they were opened.
struct Resolved {
    files: Vec<PathBuf>,
    contents: Vec<u8>,
}

fn include_names(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("#include")?.trim();
            let name = rest.strip_prefix('"')?.strip_suffix('"')?;
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

impl MockCompiler {
    /// Compile `source` in `cwd`. The search path defaults to `[cwd]` and
    /// the object to `source` with an `.o` extension.
    pub fn new(cwd: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        let source = source.into();
        Self {
            exe: PathBuf::from("/usr/bin/mockcc"),
            object: source.with_extension("o"),
            search_path: vec![cwd.clone()],
            cwd,
            source,
            pdb: None,
            extra_reads: Vec::new(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            report_include_dirs: true,
            barrier: None,
            compiles: Arc::new(AtomicUsize::new(0)),
            tracker: None,
        }
    }

    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = exe.into();
        self
    }

    /// Include search directories, relative ones resolved against cwd.
    pub fn with_search_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_path = dirs.iter().map(|d| resolve(&self.cwd, d)).collect();
        self
    }

    pub fn with_object(mut self, object: impl Into<PathBuf>) -> Self {
        self.object = object.into();
        self
    }

    /// Produce a separate debug-info file.
    pub fn with_pdb(mut self, pdb: impl Into<PathBuf>) -> Self {
        self.pdb = Some(pdb.into());
        self
    }

    /// Report `path` as read without opening it.
    pub fn with_extra_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_reads.push(path.into());
        self
    }

    /// Exit code of a compile that otherwise succeeds.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Text written on every compile.
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    /// Report no include directories at all.
    pub fn without_include_dirs(mut self) -> Self {
        self.report_include_dirs = false;
        self
    }

    /// Wait on `barrier` at the start of the first compile.
    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Share a compile counter with other mocks.
    pub fn with_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.compiles = counter;
        self
    }

    /// Number of compiles run so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    /// Tracker folder requested by the cache, if any.
    pub fn tracker(&self) -> Option<&str> {
        self.tracker.as_deref()
    }

    fn find_header(&self, name: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn resolve_sources(&self) -> Result<Resolved, String> {
        let source = resolve(&self.cwd, &self.source);
        let text = fs::read_to_string(&source)
            .map_err(|e| format!("cannot open source file {}: {}", self.source.display(), e))?;

        let mut resolved = Resolved {
            files: vec![source],
            contents: text.clone().into_bytes(),
        };
        let mut seen = BTreeSet::new();
        let mut pending: Vec<String> = include_names(&text).into_iter().rev().collect();

        while let Some(name) = pending.pop() {
            let header = self
                .find_header(&name)
                .ok_or_else(|| format!("fatal error: {}: No such file or directory", name))?;
            if !seen.insert(header.clone()) {
                continue;
            }
            let text = fs::read_to_string(&header)
                .map_err(|e| format!("cannot open {}: {}", header.display(), e))?;
            pending.extend(include_names(&text).into_iter().rev());
            resolved.contents.extend_from_slice(text.as_bytes());
            resolved.files.push(header);
        }

        Ok(resolved)
    }

    /// Write via a sibling temp file so concurrent compiles never expose a
    /// partial output.
    fn write_output(path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("{:?}.tmp", std::thread::current().id()));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)
    }

    fn headers_read(&self, files_read: &[PathBuf]) -> Vec<PathBuf> {
        let source = resolve(&self.cwd, &self.source);
        files_read
            .iter()
            .filter(|f| **f != source)
            .cloned()
            .collect()
    }
}

impl Compiler for MockCompiler {
    fn compiler_exe(&self) -> &Path {
        &self.exe
    }

    fn working_directory(&self) -> &Path {
        &self.cwd
    }

    fn single_source_file(&self) -> &Path {
        &self.source
    }

    fn object_target(&self) -> &Path {
        &self.object
    }

    fn attempt_pdb(&self) -> bool {
        self.pdb.is_some()
    }

    fn generate_pdb(&self) -> bool {
        self.pdb.is_some()
    }

    fn pdb_file(&self) -> Option<&Path> {
        self.pdb.as_deref()
    }

    fn pdb_exists_already(&self) -> bool {
        self.pdb
            .as_deref()
            .is_some_and(|p| resolve(&self.cwd, p).exists())
    }

    fn compile(
        &mut self,
        _args: &[String],
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        files_read: &mut Vec<PathBuf>,
    ) -> io::Result<i32> {
        if let Some(barrier) = self.barrier.take() {
            barrier.wait();
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);

        let resolved = match self.resolve_sources() {
            Ok(r) => r,
            Err(message) => {
                writeln!(stderr, "{}", message)?;
                return Ok(1);
            }
        };

        files_read.extend(resolved.files.iter().cloned());
        files_read.extend(self.extra_reads.iter().cloned());

        stdout.write_all(self.stdout.as_bytes())?;
        stderr.write_all(self.stderr.as_bytes())?;
        if self.exit_code != 0 {
            return Ok(self.exit_code);
        }

        let digest = Hasher::digest_bytes(&resolved.contents);
        Self::write_output(
            &resolve(&self.cwd, &self.object),
            format!("OBJ:{}\n", digest).as_bytes(),
        )?;
        if let Some(pdb) = &self.pdb {
            Self::write_output(&resolve(&self.cwd, pdb), format!("PDB:{}\n", digest).as_bytes())?;
        }
        Ok(0)
    }

    fn preprocess(&mut self, _args: &[String], out: &mut dyn Write) -> io::Result<i32> {
        match self.resolve_sources() {
            Ok(resolved) => {
                out.write_all(&resolved.contents)?;
                Ok(0)
            }
            Err(_) => Ok(1),
        }
    }

    fn used_include_dirs(&self, files_read: &[PathBuf]) -> BTreeSet<PathBuf> {
        if !self.report_include_dirs {
            return BTreeSet::new();
        }
        include::used_include_dirs(&self.search_path, files_read)
    }

    fn potential_include_files(
        &self,
        dirs: &BTreeSet<PathBuf>,
        files_read: &[PathBuf],
    ) -> Vec<PathBuf> {
        // The source is opened directly, never searched for.
        include::potential_include_files(&self.search_path, dirs, &self.headers_read(files_read))
    }

    fn enable_tracker(&mut self, folder_name: &str) {
        self.tracker = Some(folder_name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_include_names() {
        let names = include_names("#include \"a.h\"\n  #include \"sub/b.h\"\n#include <stdio.h>\nint x;");
        assert_eq!(names, vec!["a.h", "sub/b.h"]);
    }

    #[test]
    fn test_compile_follows_includes() {
        let temp = TempDir::new().unwrap();
        let cwd = temp.path();
        fs::write(cwd.join("main.c"), "#include \"util.h\"\nint main;\n").unwrap();
        fs::write(cwd.join("util.h"), "#include \"base.h\"\n").unwrap();
        fs::write(cwd.join("base.h"), "int base;\n").unwrap();

        let mut cc = MockCompiler::new(cwd, "main.c");
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut read = Vec::new();
        let code = cc.compile(&[], &mut out, &mut err, &mut read).unwrap();

        assert_eq!(code, 0);
        assert_eq!(
            read,
            vec![cwd.join("main.c"), cwd.join("util.h"), cwd.join("base.h")]
        );
        assert!(fs::read_to_string(cwd.join("main.o")).unwrap().starts_with("OBJ:"));
        assert_eq!(cc.compile_count(), 1);
    }

    #[test]
    fn test_missing_header_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("main.c"), "#include \"gone.h\"\n").unwrap();

        let mut cc = MockCompiler::new(temp.path(), "main.c");
        let mut err = Vec::new();
        let code = cc
            .compile(&[], &mut io::sink(), &mut err, &mut Vec::new())
            .unwrap();

        assert_eq!(code, 1);
        assert!(String::from_utf8(err).unwrap().contains("gone.h"));
        assert!(!temp.path().join("main.o").exists());
    }

    #[test]
    fn test_potential_includes_skip_source() {
        let temp = TempDir::new().unwrap();
        let cwd = temp.path();
        fs::create_dir(cwd.join("proj")).unwrap();
        fs::write(cwd.join("main.c"), "#include \"util.h\"\n").unwrap();
        fs::write(cwd.join("util.h"), "int u;\n").unwrap();

        let mut cc = MockCompiler::new(cwd, "main.c")
            .with_search_path(vec![PathBuf::from("proj"), cwd.to_path_buf()]);
        let mut read = Vec::new();
        cc.compile(&[], &mut io::sink(), &mut io::sink(), &mut read)
            .unwrap();

        let dirs = cc.used_include_dirs(&read);
        let potential = cc.potential_include_files(&dirs, &read);
        assert_eq!(potential, vec![cwd.join("proj").join("util.h")]);
    }
}
