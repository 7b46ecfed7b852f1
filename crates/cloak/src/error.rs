//! Error kinds shared by every cloak component

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Typed failures returned by the vault, resolver and injector.
///
/// `AuthenticationFailed` covers both a wrong key and tampered data.
/// The two are deliberately indistinguishable.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid key: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    #[error("Invalid master key format: expected 64 lowercase hex characters")]
    InvalidKeyFormat,

    #[error("Secure random source failed: {0}")]
    RandomSourceFailure(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Malformed envelope: {len} bytes is shorter than the {min}-byte nonce")]
    MalformedEnvelope { len: usize, min: usize },

    #[error("Authentication failed - wrong key or tampered data")]
    AuthenticationFailed,

    #[error("Vault not found: {} - run 'cloak init' first", .0.display())]
    StoreNotFound(PathBuf),

    #[error("Vault already exists: {}", .0.display())]
    StoreExists(PathBuf),

    #[error("Vault contents are corrupted: {0}")]
    CorruptedStore(#[source] serde_json::Error),

    #[error("Fallback key store is corrupted: {}", .path.display())]
    CorruptedKeyStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Master key not found for scope {scope}")]
    KeyNotFound { scope: String },

    #[error("Credential backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("No command provided")]
    EmptyCommand,

    #[error("Failed to start command '{program}': {source}")]
    StartFailure {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command exited with status {code}")]
    ChildExit { code: i32 },

    #[error("Serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Exit code a caller should terminate with, if the error came from a child
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ChildExit { code } => Some(*code),
            _ => None,
        }
    }
}
