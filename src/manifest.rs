//! Cache manifest: the persisted record of one cache entry.
//!
//! Stored as `manifest.json` under the entry's session hash. A manifest is
//! never edited in place; it is replaced wholesale by a later build or by a
//! disabled manifest.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// Entry name of the manifest.
pub const F_MANIFEST: &str = "manifest.json";
/// Entry name of the object code.
pub const F_OBJECT: &str = "object";
/// Entry name of the debug-info file.
pub const F_PDB: &str = "pdb";
/// Entry name of captured standard output.
pub const F_STDOUT: &str = "stdout";
/// Entry name of captured standard error.
pub const F_STDERR: &str = "stderr";

/// Dependency and metadata record of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheManifest {
    /// Next time this invocation appears, just run the compiler.
    pub disable: bool,

    /// When this manifest was created.
    pub timestamp: String,

    /// How long the original build took.
    pub duration_ms: u64,

    /// Key this manifest is stored under.
    pub session_hash: String,

    /// Hash of a debug-info file that existed before this build ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earlier_pdb_hash: Option<String>,

    /// Set when the entry was keyed on preprocessed source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessed_source_hash: Option<String>,

    /// Hash of the debug-info file this build produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdb_hash: Option<String>,

    /// Every file read by the build, the primary source included.
    pub include_files: BTreeMap<PathBuf, String>,

    /// Paths searched for but not found; creating one invalidates the entry.
    pub potential_new_includes: Vec<PathBuf>,

    pub exit_code: i32,
}

impl CacheManifest {
    /// A fresh manifest for `session_hash`, stamped with the current time.
    pub fn new(session_hash: &str) -> Self {
        Self {
            session_hash: session_hash.to_string(),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            ..Self::default()
        }
    }

    /// A poisoned manifest that forces a miss until overwritten.
    pub fn disabled(session_hash: &str) -> Self {
        Self {
            disable: true,
            ..Self::new(session_hash)
        }
    }

    /// Whether this entry was built from preprocessed source.
    pub fn pp_mode(&self) -> bool {
        self.preprocessed_source_hash
            .as_deref()
            .is_some_and(|h| !h.is_empty())
    }

    /// Paths that appear both as a dependency and as a potential include.
    pub fn overlapping_paths(&self) -> Vec<&PathBuf> {
        self.potential_new_includes
            .iter()
            .filter(|p| self.include_files.contains_key(*p))
            .collect()
    }

    pub fn from_reader<R: Read>(reader: R) -> CacheResult<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> CacheResult<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn to_json(&self) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
