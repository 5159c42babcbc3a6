//! Include search-path bookkeeping shared by [`Compiler`](super::Compiler)
//! implementations.
//!
//! A header the compiler found in search directory `k` was looked up, and
//! not found, in every directory before `k`. Those lookups are what make
//! the build sensitive to files that don't exist yet: if one of them
//! appears later, the same `#include` resolves differently.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Index of the most specific directory in `search_path` that contains
/// `file`. With nested search directories (`-I. -Iinclude`) a header under
/// `include/` resolved through `include`, not through `.`.
fn resolving_dir(search_path: &[PathBuf], file: &Path) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (k, dir) in search_path.iter().enumerate() {
        if !file.starts_with(dir) {
            continue;
        }
        let depth = dir.components().count();
        if best.map_or(true, |(_, d)| depth > d) {
            best = Some((k, depth));
        }
    }
    best.map(|(k, _)| k)
}

/// Search directories that resolved at least one file in `files_read`.
pub fn used_include_dirs(search_path: &[PathBuf], files_read: &[PathBuf]) -> BTreeSet<PathBuf> {
    files_read
        .iter()
        .filter_map(|f| resolving_dir(search_path, f))
        .map(|k| search_path[k].clone())
        .collect()
}

/// Paths that were searched for and not found while resolving `files_read`.
///
/// Only files resolved through a directory in `dirs` count. The result keeps
/// search order and holds no duplicates and no file that was actually read.
pub fn potential_include_files(
    search_path: &[PathBuf],
    dirs: &BTreeSet<PathBuf>,
    files_read: &[PathBuf],
) -> Vec<PathBuf> {
    let read: BTreeSet<&PathBuf> = files_read.iter().collect();
    let mut seen = BTreeSet::new();
    let mut potential = Vec::new();

    for file in files_read {
        let Some(k) = resolving_dir(search_path, file) else {
            continue;
        };
        if !dirs.contains(&search_path[k]) {
            continue;
        }
        let Ok(relative) = file.strip_prefix(&search_path[k]) else {
            continue;
        };

        for earlier in &search_path[..k] {
            let candidate = earlier.join(relative);
            if read.contains(&candidate) || candidate.exists() {
                continue;
            }
            if seen.insert(candidate.clone()) {
                potential.push(candidate);
            }
        }
    }

    potential
}
