//! cloak - Local secrets vault
//!
//! "Secrets should be invisible until you need them."
//!
//! A project's secrets live in one AES-256-GCM encrypted file next to the
//! code. The master key that unlocks it is kept per project in the OS
//! keyring (or a locked-down fallback file), and the secrets only ever
//! exist in plaintext inside the environment of the command you run.

pub mod crypto;
pub mod error;
pub mod inject;
pub mod keys;
pub mod vault;

pub use crypto::{generate_key, MasterKey};
pub use error::{Error, Result};
pub use keys::{
    compute_scope, CredentialStore, FallbackKeyStore, KeyLocation, KeyResolver, KeyringStore,
};
pub use vault::{LocalFs, SecretMap, VaultFs, VaultStore};
