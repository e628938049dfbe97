//! Configuration management for Topicflow.
//!
//! Handles loading configuration from TOML files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Local configuration file name, looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = ".topicflow.toml";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Parallel executor settings
    pub executor: ExecutorConfig,

    /// Event bus settings
    pub events: EventsConfig,

    /// Document cache settings
    pub cache: CacheConfig,

    /// Event hooks
    pub hooks: HooksConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding one sub-directory per topic (`~` is expanded)
    pub topics_dir: String,

    /// Path to the static workflow definition (JSON or YAML)
    pub definition: String,

    /// File name of the workflow document inside a topic directory
    pub document_name: String,
}

/// Parallel executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Whether graph execution is allowed
    pub enabled: bool,

    /// Worker pool size
    pub max_workers: usize,
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Whether events are dispatched
    pub enabled: bool,

    /// Number of events retained in history
    pub history_capacity: usize,
}

/// Document cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether read-only loads are cached
    pub enabled: bool,

    /// Entry lifetime in seconds (0 never expires)
    pub ttl_seconds: u64,
}

/// Hooks configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Master switch for every hook
    pub enabled: bool,

    /// Hook per event type
    pub events: BTreeMap<String, HookEventConfig>,
}

/// A hook bound to one event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookEventConfig {
    /// Whether this hook is installed
    pub enabled: bool,

    /// Action names to run, in order
    pub actions: Vec<String>,

    /// Minimum seconds between runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_seconds: Option<u64>,

    /// Handler priority on the event bus (higher runs first)
    pub priority: i32,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.topicflow.toml` in current directory
    /// 2. `~/.config/topicflow/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("topicflow"))
    }

    /// Topics directory with `~` and environment variables expanded.
    pub fn topics_dir(&self) -> PathBuf {
        expand(&self.general.topics_dir)
    }

    /// Workflow definition path with `~` and environment variables expanded.
    pub fn definition_path(&self) -> PathBuf {
        expand(&self.general.definition)
    }
}

fn expand(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::warn!(path = raw, error = %e, "Could not expand path, using it verbatim");
            PathBuf::from(raw)
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            topics_dir: "Project-tasks".to_string(),
            definition: ".topicflow/workflow.json".to_string(),
            document_name: "topic.json".to_string(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { enabled: true, max_workers: 4 }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { enabled: true, history_capacity: 1000 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, ttl_seconds: 60 }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self { enabled: true, events: BTreeMap::new() }
    }
}

impl Default for HookEventConfig {
    fn default() -> Self {
        Self { enabled: true, actions: Vec::new(), throttle_seconds: None, priority: 0 }
    }
}
