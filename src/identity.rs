//! Session identity: the cache key of one compiler invocation.
//!
//! session_hash = SHA-256 hex digest of JCS(identity inputs), where the
//! inputs are the compiler identity, the selected environment, the working
//! directory and the argument vector.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};
use crate::hash::Hasher;

/// How the compiler itself contributes to the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerIdentity {
    /// Hash of the compiler binary's contents. Survives reinstalls to a new
    /// path and invalidates on upgrades in place.
    #[default]
    Binary,
    /// The compiler path only. Cheaper, but an in-place compiler upgrade
    /// keeps hitting entries built by the old compiler.
    Path,
}

/// Identity settings (`[identity]` in the config file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub compiler_identity: CompilerIdentity,
    /// Environment variables folded into the identity. Anything else in the
    /// environment is ignored.
    pub env_allowlist: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            compiler_identity: CompilerIdentity::Binary,
            env_allowlist: [
                "INCLUDE",
                "LIB",
                "LIBPATH",
                "CPATH",
                "C_INCLUDE_PATH",
                "CPLUS_INCLUDE_PATH",
                "SOURCE_DATE_EPOCH",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Canonical object hashed to produce the session hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInputs {
    /// Compiler path or `sha256:<digest>` of its binary
    pub compiler: String,
    /// Allowlisted environment, sorted by name
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: String,
    /// Arguments in invocation order
    pub args: Vec<String>,
}

impl IdentityInputs {
    /// Gather identity inputs for an invocation.
    ///
    /// A binary compiler identity is hashed through `hasher`, so a long-lived
    /// hasher skips re-reading an unchanged compiler.
    pub fn gather<I, K, V>(
        config: &IdentityConfig,
        hasher: &Hasher,
        compiler_exe: &Path,
        env: I,
        cwd: &Path,
        args: &[String],
    ) -> CacheResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let compiler = match config.compiler_identity {
            CompilerIdentity::Path => compiler_exe.display().to_string(),
            CompilerIdentity::Binary => {
                let digest = hasher.digest_file(compiler_exe);
                if !digest.is_ok() {
                    return Err(CacheError::Identity(format!(
                        "cannot hash compiler {}: {}",
                        compiler_exe.display(),
                        digest.result
                    )));
                }
                format!("sha256:{}", digest.hash)
            }
        };

        let env = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| config.env_allowlist.iter().any(|a| a == k))
            .collect();

        Ok(Self {
            compiler,
            env,
            cwd: cwd.display().to_string(),
            args: args.to_vec(),
        })
    }

    /// Compute the session identity using RFC 8785 JSON canonicalization.
    pub fn compute(&self) -> CacheResult<SessionIdentity> {
        let jcs_bytes = serde_json_canonicalizer::to_vec(self)
            .map_err(|e| CacheError::Identity(e.to_string()))?;
        Ok(SessionIdentity {
            session_hash: Hasher::digest_bytes(&jcs_bytes),
        })
    }
}

/// The cache key of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_hash: String,
}

impl SessionIdentity {
    pub fn new(session_hash: impl Into<String>) -> Self {
        Self {
            session_hash: session_hash.into(),
        }
    }

    /// A new identity covering this one plus `extra` material.
    pub fn derive(&self, extra: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.session_hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(extra.as_bytes());
        Self {
            session_hash: hex::encode(hasher.finalize()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.session_hash
    }
}

impl std::fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.session_hash)
    }
}
