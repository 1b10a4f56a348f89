//! Core configuration.
//!
//! Loaded from `<data_dir>/config.json`. Every field has a default, so a
//! missing file or a partial file is fine; the daemon layers command-line
//! flags on top.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;
use crate::persistence::atomic_write;
use crate::registry::DEFAULT_MAX_PER_USER;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No data directory: {0}")]
    NoDataDir(String),
}

/// A named runtime profile selectable at session creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Appended to the agent's system prompt.
    pub system_prompt: Option<String>,
    pub extra_args: Vec<String>,
}

/// Settings for [`ClaudeCliRuntime`](crate::runtime::ClaudeCliRuntime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeRuntimeConfig {
    /// Absolute path, or a bare name looked up on PATH.
    pub binary_path: String,
    /// Overrides the default `$SHELL -l -c`.
    pub shell_prefix: Option<String>,
    /// Where the runtime keeps its session index.
    pub state_dir: Option<PathBuf>,
    /// Per-session transcript logs; `None` disables them.
    pub log_dir: Option<PathBuf>,
    pub bundles: BTreeMap<String, BundleConfig>,
}

impl Default for ClaudeRuntimeConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            shell_prefix: None,
            state_dir: None,
            log_dir: None,
            bundles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Use the in-memory mock backend instead of a real runtime.
    pub dev_mode: bool,
    /// Defaults to `~/.sessionhub`.
    pub data_dir: Option<PathBuf>,
    pub max_per_user: usize,
    pub runtime: ClaudeRuntimeConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            data_dir: None,
            max_per_user: DEFAULT_MAX_PER_USER,
            runtime: ClaudeRuntimeConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load config from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())?;
        Ok(())
    }

    /// The configured data dir, or `~/.sessionhub`.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_data_dir().map_err(ConfigError::NoDataDir),
        }
    }

    /// Fill runtime directories left unset with locations under the data dir.
    pub fn resolve_dirs(mut self) -> Result<Self, ConfigError> {
        let data_dir = self.data_dir()?;
        if self.runtime.state_dir.is_none() {
            self.runtime.state_dir = Some(data_dir.join("runtime"));
        }
        if self.runtime.log_dir.is_none() {
            self.runtime.log_dir = Some(data_dir.join("logs"));
        }
        self.data_dir = Some(data_dir);
        Ok(self)
    }
}
