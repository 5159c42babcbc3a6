//! Diagnostic surface: free-form trace plus structured miss records.
//!
//! Every miss decision produces exactly one [`MissRecord`]. The default
//! [`TracingSink`] logs it through `tracing` and, when a miss log is
//! configured, appends it as one JSON line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hash::DataHashResult;

/// Why one lookup failed to hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissRecord {
    pub timestamp: String,
    pub identity: String,
    pub reason: DataHashResult,
    pub cwd: PathBuf,
    pub source_file: PathBuf,
    /// Offending path or short explanation; empty when not applicable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl MissRecord {
    pub fn new(
        identity: &str,
        reason: DataHashResult,
        cwd: &Path,
        source_file: &Path,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            identity: identity.to_string(),
            reason,
            cwd: cwd.to_path_buf(),
            source_file: source_file.to_path_buf(),
            detail: detail.into(),
        }
    }
}

/// Receiver of cache diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// Free-form trace message.
    fn emit(&self, message: &str);

    /// Structured miss record.
    fn miss(&self, record: &MissRecord);
}

/// Sink backed by `tracing`, with an optional JSON-lines miss log.
#[derive(Debug, Default)]
pub struct TracingSink {
    miss_log: Option<PathBuf>,
    // Serializes appends from threads sharing this sink.
    append: Mutex<()>,
}

impl TracingSink {
    pub fn new(miss_log: Option<PathBuf>) -> Self {
        Self {
            miss_log,
            append: Mutex::new(()),
        }
    }

    fn append_miss_log(&self, path: &Path, record: &MissRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _held = self.append.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)
    }
}

impl DiagnosticSink for TracingSink {
    fn emit(&self, message: &str) {
        debug!("{}", message);
    }

    fn miss(&self, record: &MissRecord) {
        info!(
            identity = %record.identity,
            reason = %record.reason,
            cwd = %record.cwd.display(),
            source = %record.source_file.display(),
            detail = %record.detail,
            "cache miss"
        );

        if let Some(path) = &self.miss_log {
            if let Err(e) = self.append_miss_log(path, record) {
                warn!(path = %path.display(), error = %e, "failed to append miss log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_miss_log_appends_json_lines() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("misses.jsonl");
        let sink = TracingSink::new(Some(log.clone()));

        sink.miss(&MissRecord::new(
            "h1",
            DataHashResult::NoPreviousBuild,
            Path::new("/src"),
            Path::new("main.c"),
            "",
        ));
        sink.miss(&MissRecord::new(
            "h1",
            DataHashResult::FileChanged,
            Path::new("/src"),
            Path::new("main.c"),
            "util.h",
        ));

        let content = fs::read_to_string(&log).unwrap();
        let records: Vec<MissRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reason, DataHashResult::NoPreviousBuild);
        assert!(!content.lines().next().unwrap().contains("detail"));
        assert_eq!(records[1].detail, "util.h");
    }

    #[test]
    fn test_unwritable_miss_log_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let sink = TracingSink::new(Some(temp.path().join("no-such-dir").join("log")));

        sink.miss(&MissRecord::new(
            "h1",
            DataHashResult::CacheCorrupt,
            Path::new("/src"),
            Path::new("main.c"),
            "",
        ));
    }
}
