//! Content hashing for source and include files.
//!
//! Files are digested with SHA-256 (hex). Digests are memoised per
//! [`Hasher`] keyed by path, size and modification time; a file touched
//! within the last [`Hasher::MEMO_SETTLE`] is always re-read since its
//! timestamp can't yet be trusted to change on the next write.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of hashing one file, or of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataHashResult {
    Ok,
    FileAdded,
    FileChanged,
    FileMissing,
    CacheCorrupt,
    NoPreviousBuild,
}

impl fmt::Display for DataHashResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "Ok",
            Self::FileAdded => "FileAdded",
            Self::FileChanged => "FileChanged",
            Self::FileMissing => "FileMissing",
            Self::CacheCorrupt => "CacheCorrupt",
            Self::NoPreviousBuild => "NoPreviousBuild",
        };
        f.write_str(s)
    }
}

/// A hash value plus the status of computing it.
///
/// The value is empty unless `result` is [`DataHashResult::Ok`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHash {
    pub hash: String,
    pub result: DataHashResult,
}

impl DataHash {
    pub fn ok(hash: String) -> Self {
        Self {
            hash,
            result: DataHashResult::Ok,
        }
    }

    pub fn failed(result: DataHashResult) -> Self {
        Self {
            hash: String::new(),
            result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == DataHashResult::Ok
    }
}

#[derive(Debug, Clone)]
struct MemoEntry {
    len: u64,
    modified: SystemTime,
    hash: String,
}

/// File hasher with a metadata-keyed digest memo.
#[derive(Debug, Default)]
pub struct Hasher {
    memo: RwLock<HashMap<PathBuf, MemoEntry>>,
}

impl Hasher {
    /// Files modified more recently than this are never memoised.
    pub const MEMO_SETTLE: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 hex digest of a byte slice.
    pub fn digest_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// SHA-256 hex digest of a reader's contents.
    pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Hash one file. Never fails; problems are reported in the result status.
    pub fn digest_file(&self, path: &Path) -> DataHash {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return DataHash::failed(DataHashResult::CacheCorrupt),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return DataHash::failed(DataHashResult::FileMissing)
            }
            Err(_) => return DataHash::failed(DataHashResult::CacheCorrupt),
        };
        let modified = metadata.modified().ok();

        if let Some(modified) = modified {
            if let Some(hash) = self.memo_lookup(path, metadata.len(), modified) {
                return DataHash::ok(hash);
            }
        }

        let hash = match File::open(path).and_then(Self::digest_reader) {
            Ok(hash) => hash,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return DataHash::failed(DataHashResult::FileMissing)
            }
            Err(_) => return DataHash::failed(DataHashResult::CacheCorrupt),
        };

        if let Some(modified) = modified {
            let settled = modified
                .elapsed()
                .map(|age| age >= Self::MEMO_SETTLE)
                .unwrap_or(false);
            if settled {
                if let Ok(mut memo) = self.memo.write() {
                    memo.insert(
                        path.to_path_buf(),
                        MemoEntry {
                            len: metadata.len(),
                            modified,
                            hash: hash.clone(),
                        },
                    );
                }
            }
        }

        DataHash::ok(hash)
    }

    fn memo_lookup(&self, path: &Path, len: u64, modified: SystemTime) -> Option<String> {
        let memo = self.memo.read().ok()?;
        let entry = memo.get(path)?;
        (entry.len == len && entry.modified == modified).then(|| entry.hash.clone())
    }

    /// Number of memoised digests.
    pub fn memo_len(&self) -> usize {
        self.memo.read().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn age_file(path: &Path) {
        let old = SystemTime::now() - Duration::from_secs(60);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(old)
            .unwrap();
    }

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(
            Hasher::digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_file_matches_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("util.h");
        fs::write(&path, "int util(void);\n").unwrap();

        let hash = Hasher::new().digest_file(&path);

        assert!(hash.is_ok());
        assert_eq!(hash.hash, Hasher::digest_bytes(b"int util(void);\n"));
    }

    #[test]
    fn test_digest_missing_file() {
        let temp = TempDir::new().unwrap();
        let hash = Hasher::new().digest_file(&temp.path().join("gone.h"));

        assert_eq!(hash.result, DataHashResult::FileMissing);
        assert!(hash.hash.is_empty());
    }

    #[test]
    fn test_digest_directory_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let hash = Hasher::new().digest_file(temp.path());
        assert_eq!(hash.result, DataHashResult::CacheCorrupt);
    }

    #[test]
    fn test_fresh_files_not_memoised() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fresh.h");
        fs::write(&path, "x").unwrap();

        let hasher = Hasher::new();
        hasher.digest_file(&path);

        assert_eq!(hasher.memo_len(), 0);
    }

    #[test]
    fn test_memo_invalidated_by_change() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.h");
        fs::write(&path, "#define A 1\n").unwrap();
        age_file(&path);

        let hasher = Hasher::new();
        let first = hasher.digest_file(&path);
        assert_eq!(hasher.memo_len(), 1);
        assert_eq!(hasher.digest_file(&path), first);

        fs::write(&path, "#define A 22\n").unwrap();
        let second = hasher.digest_file(&path);

        assert!(second.is_ok());
        assert_ne!(first.hash, second.hash);
    }
}
