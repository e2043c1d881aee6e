//! Tiering configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TieringError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TieringConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl TieringConfig {
    /// Load config from the default path (~/.tiering/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TieringError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TieringError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TieringError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the tiering home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tiering")
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.tiering/tiering.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Schedule used when the CLI is invoked without `--schedule`.
    #[serde(default = "default_schedule")]
    pub default_schedule: String,
    /// How often the daemon trigger wakes up to evaluate the gate.
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_secs: u64,
    /// What to do with items left tagged by a batch that did not finish.
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    /// Describe actions instead of executing them.
    #[serde(default = "bool_true")]
    pub dry_run: bool,
}

fn bool_true() -> bool { true }
fn default_schedule() -> String { "DEFAULT_SCHEDULE".into() }
fn default_trigger_interval() -> u64 { 3600 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_schedule: default_schedule(),
            trigger_interval_secs: default_trigger_interval(),
            orphan_policy: OrphanPolicy::default(),
            dry_run: true,
        }
    }
}

/// Recovery policy for queue items tagged into a batch that is no longer running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Clear the batch tag so the item is selected again.
    #[default]
    Release,
    /// Leave the tag in place; the item is excluded from selection until
    /// an operator releases it.
    Hold,
}
