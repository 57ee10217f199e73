//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_COORDINATOR_URL: &str = "http://localhost:8080";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Coordinator base URL
    pub coordinator_url: Option<String>,
    /// Default output format
    pub default_format: Option<String>,
}

impl Config {
    /// Load configuration from the user config file, if present
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Flag or env value first, then the config file, then the default
    pub fn coordinator_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.coordinator_url.clone())
            .unwrap_or_else(|| DEFAULT_COORDINATOR_URL.to_string())
    }

    /// `~/.config/remedy/config.json` (or the platform equivalent)
    fn config_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|dir| dir.join("remedy").join("config.json"))
    }
}
