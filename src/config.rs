//! Cache configuration
//!
//! Three layers, later layers win:
//! 1. Built-in defaults
//! 2. Config file (`OBJCACHE_CONFIG`, else `<cache_dir>/objcache.toml`)
//! 3. Environment overrides (`OBJCACHE_*`)

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{CompilerIdentity, IdentityConfig};

/// Config file name looked up inside the cache directory.
pub const CONFIG_FILENAME: &str = "objcache.toml";

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Which miss handler keys and records entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Key on the raw invocation, track include files.
    #[default]
    Direct,
    /// Key on the preprocessed source text.
    Preprocessor,
}

impl StrategyKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "preprocessor" | "pp" => Some(Self::Preprocessor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Preprocessor => "preprocessor",
        }
    }
}

/// Effective cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the artifact store and lock files
    pub cache_dir: PathBuf,
    /// Bypass the cache entirely
    pub disabled: bool,
    /// Miss handling strategy
    pub strategy: StrategyKind,
    /// Longest wait for a cache lock before compiling uncached
    pub lock_timeout_ms: u64,
    /// Ask the compiler to track file accesses during misses
    pub tracker_mode: bool,
    /// Append every miss record here as JSON lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miss_log: Option<PathBuf>,
    /// Session identity settings
    pub identity: IdentityConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            disabled: false,
            strategy: StrategyKind::Direct,
            lock_timeout_ms: 30_000,
            tracker_mode: false,
            miss_log: None,
            identity: IdentityConfig::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".objcache"),
        None => std::env::temp_dir().join("objcache"),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl CacheConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Apply `OBJCACHE_*` overrides.
    pub fn apply_env(&mut self, vars: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        if let Some(dir) = vars.get("OBJCACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(v) = vars.get("OBJCACHE_DISABLE") {
            self.disabled = parse_bool("OBJCACHE_DISABLE", v)?;
        }
        if let Some(v) = vars.get("OBJCACHE_STRATEGY") {
            self.strategy = StrategyKind::from_str(v).ok_or_else(|| ConfigError::InvalidValue {
                key: "OBJCACHE_STRATEGY".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = vars.get("OBJCACHE_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "OBJCACHE_LOCK_TIMEOUT_MS".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = vars.get("OBJCACHE_TRACKER") {
            self.tracker_mode = parse_bool("OBJCACHE_TRACKER", v)?;
        }
        if let Some(v) = vars.get("OBJCACHE_MISS_LOG") {
            self.miss_log = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = vars.get("OBJCACHE_COMPILER_IDENTITY") {
            self.identity.compiler_identity = match v.as_str() {
                "binary" => CompilerIdentity::Binary,
                "path" => CompilerIdentity::Path,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "OBJCACHE_COMPILER_IDENTITY".to_string(),
                        value: v.clone(),
                    })
                }
            };
        }
        Ok(())
    }

    /// Resolve the effective config from a set of environment variables.
    pub fn resolve(vars: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let cache_dir = vars
            .get("OBJCACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);

        let file = match vars.get("OBJCACHE_CONFIG") {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let candidate = cache_dir.join(CONFIG_FILENAME);
                candidate.is_file().then_some(candidate)
            }
        };

        let mut config = match file {
            Some(path) => Self::load(&path)?,
            None => Self {
                cache_dir,
                ..Self::default()
            },
        };
        config.apply_env(vars)?;
        Ok(config)
    }

    /// Resolve the effective config from the process environment.
    pub fn from_environment() -> Result<Self, ConfigError> {
        let vars: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("OBJCACHE_"))
            .collect();
        Self::resolve(&vars)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
