//! Content-addressed artifact store.
//!
//! Entries are grouped under a key (the session hash of a compiler
//! invocation) and addressed by name. Two-level fan-out layout:
//! `<store_root>/<key[0:2]>/<key>/<name>`
//!
//! Whole-file writes go through a temp file in `<store_root>/.tmp` followed
//! by a rename, so a reader never sees a half-written entry.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid store key: {0:?}")]
    InvalidKey(String),

    #[error("invalid entry name: {0:?}")]
    InvalidName(String),

    #[error("entry {name} not found under key {key}")]
    EntryNotFound { key: String, name: String },
}

/// Opaque key/value blob store used by the cache engine.
///
/// Keys identify one cache entry; names identify artifacts within it.
pub trait CacheStore: Send + Sync {
    /// Root directory of the store.
    fn root(&self) -> &Path;

    /// Make sure storage for `key` exists.
    fn ensure_key(&self, key: &str) -> StoreResult<()>;

    /// Whether an artifact `name` exists under `key`.
    fn contains_entry(&self, key: &str, name: &str) -> bool;

    /// Copy the file at `source` into the store as `name`. Returns bytes stored.
    fn add_file(&self, key: &str, source: &Path, name: &str) -> StoreResult<u64>;

    /// Atomically replace artifact `name` with `bytes`.
    fn write_entry(&self, key: &str, name: &str, bytes: &[u8]) -> StoreResult<()>;

    /// Open artifact `name` for reading.
    fn open_entry(&self, key: &str, name: &str) -> StoreResult<BufReader<File>>;

    /// Read artifact `name` fully.
    fn read_entry(&self, key: &str, name: &str) -> StoreResult<Vec<u8>> {
        let mut reader = self.open_entry(key, name)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Remove every artifact under `key`. Returns whether anything was removed.
    fn remove(&self, key: &str) -> StoreResult<bool>;

    /// Filesystem path of artifact `name` under `key`.
    fn entry_path(&self, key: &str, name: &str) -> PathBuf;
}

/// Summary of one stored key.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// The key.
    pub key: String,
    /// Names of artifacts stored under it.
    pub entries: Vec<String>,
    /// Total bytes across artifacts.
    pub size: u64,
}

/// Filesystem-backed [`CacheStore`].
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    store_root: PathBuf,
}

impl FileCacheStore {
    /// Create a store at the given root directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(store_root: impl AsRef<Path>) -> StoreResult<Self> {
        let store_root = store_root.as_ref().to_path_buf();
        fs::create_dir_all(&store_root)?;
        Ok(Self { store_root })
    }

    fn validate_key(key: &str) -> StoreResult<()> {
        if key.len() < 2 || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn validate_name(name: &str) -> StoreResult<()> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Directory holding all artifacts of a key.
    pub fn key_dir(&self, key: &str) -> PathBuf {
        let prefix = &key[..2.min(key.len())];
        self.store_root.join(prefix).join(key)
    }

    fn temp_dir(&self) -> PathBuf {
        self.store_root.join(".tmp")
    }

    fn temp_path(&self) -> StoreResult<PathBuf> {
        let temp_dir = self.temp_dir();
        fs::create_dir_all(&temp_dir)?;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let thread = format!("{:?}", std::thread::current().id())
            .chars()
            .filter(char::is_ascii_digit)
            .collect::<String>();
        Ok(temp_dir.join(format!(".tmp.{}.{}.{}", std::process::id(), thread, nanos)))
    }

    /// Move a finished temp file into place.
    fn commit(&self, temp_path: &Path, key: &str, name: &str) -> StoreResult<()> {
        let key_dir = self.key_dir(key);
        if let Err(e) = fs::create_dir_all(&key_dir) {
            let _ = fs::remove_file(temp_path);
            return Err(StoreError::Io(e));
        }
        if let Err(e) = fs::rename(temp_path, key_dir.join(name)) {
            let _ = fs::remove_file(temp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    /// List every key in the store with its artifacts and size.
    pub fn list_keys(&self) -> StoreResult<Vec<KeyInfo>> {
        let mut keys = Vec::new();

        for prefix_entry in fs::read_dir(&self.store_root)? {
            let prefix_path = prefix_entry?.path();
            if !prefix_path.is_dir() {
                continue;
            }
            match prefix_path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name.len() == 2 && !name.starts_with('.') => {}
                _ => continue,
            }

            for key_entry in fs::read_dir(&prefix_path)? {
                let key_path = key_entry?.path();
                if !key_path.is_dir() {
                    continue;
                }
                let Some(key) = key_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };

                let mut entries = Vec::new();
                let mut size = 0;
                for artifact in fs::read_dir(&key_path)? {
                    let artifact = artifact?;
                    let metadata = artifact.metadata()?;
                    if metadata.is_file() {
                        size += metadata.len();
                        entries.push(artifact.file_name().to_string_lossy().into_owned());
                    }
                }
                entries.sort();

                keys.push(KeyInfo {
                    key: key.to_string(),
                    entries,
                    size,
                });
            }
        }

        keys.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(keys)
    }

    /// Total bytes held by the store, lock and temp files included.
    pub fn total_size(&self) -> u64 {
        WalkDir::new(&self.store_root)
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

impl CacheStore for FileCacheStore {
    fn root(&self) -> &Path {
        &self.store_root
    }

    fn ensure_key(&self, key: &str) -> StoreResult<()> {
        Self::validate_key(key)?;
        fs::create_dir_all(self.key_dir(key))?;
        Ok(())
    }

    fn contains_entry(&self, key: &str, name: &str) -> bool {
        if Self::validate_key(key).is_err() || Self::validate_name(name).is_err() {
            return false;
        }
        self.entry_path(key, name).is_file()
    }

    fn add_file(&self, key: &str, source: &Path, name: &str) -> StoreResult<u64> {
        Self::validate_key(key)?;
        Self::validate_name(name)?;

        let temp_path = self.temp_path()?;
        let copied = match fs::copy(source, &temp_path) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(StoreError::Io(e));
            }
        };
        self.commit(&temp_path, key, name)?;

        debug!(key, name, bytes = copied, source = %source.display(), "stored artifact");
        Ok(copied)
    }

    fn write_entry(&self, key: &str, name: &str, bytes: &[u8]) -> StoreResult<()> {
        Self::validate_key(key)?;
        Self::validate_name(name)?;

        let temp_path = self.temp_path()?;
        let written = File::create(&temp_path).and_then(|mut f| {
            f.write_all(bytes)?;
            f.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }
        self.commit(&temp_path, key, name)
    }

    fn open_entry(&self, key: &str, name: &str) -> StoreResult<BufReader<File>> {
        Self::validate_key(key)?;
        Self::validate_name(name)?;

        match File::open(self.entry_path(key, name)) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::EntryNotFound {
                key: key.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        Self::validate_key(key)?;

        let key_dir = self.key_dir(key);
        if !key_dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&key_dir)?;

        // Drop the fan-out directory once it empties; a concurrent writer may
        // have refilled it, in which case removal fails and that's fine.
        if let Some(prefix_dir) = key_dir.parent() {
            let _ = fs::remove_dir(prefix_dir);
        }

        debug!(key, "removed key");
        Ok(true)
    }

    fn entry_path(&self, key: &str, name: &str) -> PathBuf {
        self.key_dir(key).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "ab12cd34ef";

    fn make_store() -> (TempDir, FileCacheStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp_dir.path().join("store")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_fan_out_layout() {
        let (_temp, store) = make_store();
        let path = store.entry_path(KEY, "object");
        assert!(path.ends_with("ab/ab12cd34ef/object"));
    }

    #[test]
    fn test_write_and_read_entry() {
        let (_temp, store) = make_store();

        store.write_entry(KEY, "stdout", b"warning: unused").unwrap();

        assert!(store.contains_entry(KEY, "stdout"));
        assert_eq!(store.read_entry(KEY, "stdout").unwrap(), b"warning: unused");
    }

    #[test]
    fn test_write_entry_replaces() {
        let (_temp, store) = make_store();

        store.write_entry(KEY, "manifest.json", b"first").unwrap();
        store.write_entry(KEY, "manifest.json", b"second").unwrap();

        assert_eq!(store.read_entry(KEY, "manifest.json").unwrap(), b"second");
        assert!(
            fs::read_dir(store.root().join(".tmp")).unwrap().next().is_none(),
            "temp files must not linger"
        );
    }

    #[test]
    fn test_add_file() {
        let (temp, store) = make_store();
        let source = temp.path().join("main.o");
        fs::write(&source, b"\x7fELF object").unwrap();

        let bytes = store.add_file(KEY, &source, "object").unwrap();

        assert_eq!(bytes, 11);
        assert_eq!(store.read_entry(KEY, "object").unwrap(), b"\x7fELF object");
    }

    #[test]
    fn test_add_missing_file_fails_cleanly() {
        let (temp, store) = make_store();
        let result = store.add_file(KEY, &temp.path().join("nope.o"), "object");

        assert!(matches!(result, Err(StoreError::Io(_))));
        assert!(!store.contains_entry(KEY, "object"));
    }

    #[test]
    fn test_open_missing_entry() {
        let (_temp, store) = make_store();
        let result = store.open_entry(KEY, "object");
        assert!(matches!(result, Err(StoreError::EntryNotFound { .. })));
    }

    #[test]
    fn test_remove() {
        let (_temp, store) = make_store();
        store.write_entry(KEY, "object", b"obj").unwrap();

        assert!(store.remove(KEY).unwrap());
        assert!(!store.contains_entry(KEY, "object"));
        assert!(!store.key_dir(KEY).exists());
        assert!(!store.remove(KEY).unwrap());
    }

    #[test]
    fn test_invalid_key_and_name() {
        let (_temp, store) = make_store();

        assert!(matches!(store.ensure_key("../etc"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(
            store.write_entry(KEY, "../escape", b""),
            Err(StoreError::InvalidName(_))
        ));
        assert!(!store.contains_entry("x", "object"));
    }

    #[test]
    fn test_list_keys() {
        let (_temp, store) = make_store();
        store.write_entry("aa0001", "object", b"12345").unwrap();
        store.write_entry("aa0001", "manifest.json", b"{}").unwrap();
        store.write_entry("bb0002", "object", b"1").unwrap();

        let keys = store.list_keys().unwrap();

        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key, "aa0001");
        assert_eq!(keys[0].entries, vec!["manifest.json", "object"]);
        assert_eq!(keys[0].size, 7);
        assert_eq!(keys[1].key, "bb0002");
        assert!(store.total_size() >= 8);
    }
}
