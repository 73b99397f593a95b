#![forbid(unsafe_code)]

//! Engine configuration.
//!
//! Read from TOML, in order of precedence: an explicit path, the
//! `KGQUERY_CONFIG` environment variable, `<config dir>/kgquery/engine.toml`.
//! A path named by the caller or the environment must exist; a missing
//! default file yields defaults.
//!
//! ```toml
//! dialect = "cypher"
//! max_memory_bytes = 268435456
//!
//! [bootstrap]
//! retries = 5
//! base_delay_ms = 2000
//!
//! [scope]
//! parallel = true
//! relevant_spaces = ["queries"]
//! ```

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::Dialect;
use crate::types::SpaceName;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "KGQUERY_CONFIG";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Statement dialect of the backend.
    pub dialect: Dialect,
    /// Memory ceiling forwarded with every statement.
    pub max_memory_bytes: Option<u64>,
    /// Schema provisioning.
    pub bootstrap: BootstrapConfig,
    /// Scope computation.
    pub scope: ScopeConfig,
}

/// Retry budget for schema provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            retries: 5,
            base_delay_ms: 2000,
        }
    }
}

/// Scope engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Run the scope queries of one instance concurrently.
    pub parallel: bool,
    /// Spaces whose scope queries count; the catalog decides when unset.
    pub relevant_spaces: Option<BTreeSet<SpaceName>>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        ScopeConfig {
            parallel: true,
            relevant_spaces: None,
        }
    }
}

impl EngineConfig {
    /// Loads the configuration.
    ///
    /// Falls back to defaults only when no path was named and the default
    /// file does not exist.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit.or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            return read_file(&path);
        }
        match default_config_path() {
            Some(path) if path.exists() => read_file(&path),
            _ => Ok(EngineConfig::default()),
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read engine config {path}: {source}")]
    Read {
        /// Config file.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`EngineConfig`].
    #[error("failed to parse engine config {path}: {source}")]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Underlying failure.
        source: toml::de::Error,
    },
}

/// `<config dir>/kgquery/engine.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("kgquery").join("engine.toml"))
}
