//! Configuration management for cloak
//!
//! Read from ~/.config/cloak/config.json. A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::paths::Paths;
use crate::{DEFAULT_ENV_VAR, DEFAULT_KEYRING_SERVICE, DEFAULT_VAULT_FILE};

/// Global cloak configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Vault file, resolved against the project directory when relative
    #[serde(default = "default_vault_file")]
    pub vault_file: PathBuf,

    /// Environment variable holding a master key override
    #[serde(default = "default_env_var")]
    pub env_var: String,

    /// Service name for OS keyring entries
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,

    /// Location of the fallback key store (defaults to ~/.cloak/keys.json)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_path: Option<PathBuf>,
}

fn default_vault_file() -> PathBuf {
    PathBuf::from(DEFAULT_VAULT_FILE)
}

fn default_env_var() -> String {
    DEFAULT_ENV_VAR.to_string()
}

fn default_keyring_service() -> String {
    DEFAULT_KEYRING_SERVICE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_file: default_vault_file(),
            env_var: default_env_var(),
            keyring_service: default_keyring_service(),
            fallback_path: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Vault file location for a project directory
    pub fn vault_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.vault_file)
    }

    /// Fallback key store location
    pub fn fallback_path(&self, paths: &Paths) -> PathBuf {
        self.fallback_path
            .clone()
            .unwrap_or_else(|| paths.fallback_keys())
    }
}
