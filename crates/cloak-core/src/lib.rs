//! Cloak Core - Shared paths and configuration for the cloak tools
//!
//! Everything here is plain data: where cloak keeps its files and which
//! names it uses when talking to the environment and the OS keyring.

pub mod config;
pub mod paths;

pub use config::Config;
pub use paths::Paths;

/// Default vault file name, relative to the project directory
pub const DEFAULT_VAULT_FILE: &str = "cloak.encrypted";

/// Environment variable that overrides every other key source
pub const DEFAULT_ENV_VAR: &str = "CLOAK_MASTER_KEY";

/// Service name used for OS keyring entries
pub const DEFAULT_KEYRING_SERVICE: &str = "cloak-cli";
