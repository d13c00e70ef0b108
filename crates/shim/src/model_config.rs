//! Lazily loaded, process-wide cached agent-model rewrite configuration.
//!
//! `config.yaml` lives under `%LOCALAPPDATA%\myT-x`, with the roaming
//! `%APPDATA%` tree as fallback. A successful load (including "no file") is
//! cached for the life of the process; a failed load leaves the cache unset
//! so a later invocation can retry.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use mytx_common::paths;
use once_cell::sync::Lazy;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelConfigError {
    #[error("failed reading model config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed parsing model config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// `agent_model` section of `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentModelConfig {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub overrides: Vec<ModelOverride>,
}

/// First matching pattern wins; patterns match case-insensitively as
/// substrings of the `--agent-name` value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelOverride {
    pub name_pattern: String,
    pub model: String,
}

impl AgentModelConfig {
    /// True when neither the fallback rule nor any override can fire.
    pub fn is_empty(&self) -> bool {
        !self.has_fallback() && self.overrides.is_empty()
    }

    /// The `from`/`to` rule needs both sides non-blank.
    pub fn has_fallback(&self) -> bool {
        !self.from.trim().is_empty() && !self.to.trim().is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    agent_model: Option<AgentModelConfig>,
}

#[derive(Default)]
enum CacheState {
    #[default]
    Unloaded,
    Loaded(Option<Arc<AgentModelConfig>>),
}

static CACHE: Lazy<Mutex<CacheState>> = Lazy::new(Mutex::default);

/// Load the config, serving repeat calls from the process-wide cache.
/// Concurrent callers share the returned `Arc` and must treat it as
/// read-only.
pub fn load_cached() -> Result<Option<Arc<AgentModelConfig>>, ModelConfigError> {
    let mut state = CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let CacheState::Loaded(cached) = &*state {
        return Ok(cached.clone());
    }
    let loaded = load_from_disk()?.map(Arc::new);
    *state = CacheState::Loaded(loaded.clone());
    Ok(loaded)
}

fn load_from_disk() -> Result<Option<AgentModelConfig>, ModelConfigError> {
    let Some(path) = existing_config_path() else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(&path).map_err(|source| ModelConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let file: ConfigFile =
        serde_yaml::from_str(&text).map_err(|source| ModelConfigError::Parse { path, source })?;
    Ok(file.agent_model)
}

fn existing_config_path() -> Option<PathBuf> {
    if let Ok(primary) = paths::config_file() {
        if primary.is_file() {
            return Some(primary);
        }
    }
    // roaming fallback; the debug log deliberately has no such fallback
    if let Ok(fallback) = paths::config_file_fallback() {
        if fallback.is_file() {
            return Some(fallback);
        }
    }
    None
}

#[cfg(test)]
pub(crate) fn reset_cache_for_tests() {
    *CACHE.lock().unwrap_or_else(|e| e.into_inner()) = CacheState::Unloaded;
}
