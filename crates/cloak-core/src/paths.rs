//! Standard paths used by cloak

use std::path::{Path, PathBuf};

/// Standard cloak paths
pub struct Paths {
    /// Private state directory (~/.cloak)
    pub home: PathBuf,
    /// Config directory (~/.config/cloak)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(".cloak");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cloak");

        Self { home, config }
    }

    /// Paths rooted somewhere other than the user's home directory
    pub fn under(root: &Path) -> Self {
        Self {
            home: root.join(".cloak"),
            config: root.join(".config").join("cloak"),
        }
    }

    /// Fallback key store used when the OS keyring is unavailable
    pub fn fallback_keys(&self) -> PathBuf {
        self.home.join("keys.json")
    }

    /// Global config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }
}
