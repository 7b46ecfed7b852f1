//! Vault - Encrypted secrets storage
//!
//! The whole secret map lives in one file: the AES-256-GCM envelope of its
//! JSON encoding. Writes go to a temporary file in the same directory and are
//! renamed over the destination, so the vault on disk is always either the
//! previous version or the new one.

use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{self, MasterKey};
use crate::error::{Error, Result};

/// Secret name to value. Ordered so the serialized form is deterministic.
pub type SecretMap = BTreeMap<String, String>;

/// The filesystem operations the vault needs, and nothing more
pub trait VaultFs {
    /// Read a whole file
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Check whether a file exists
    fn exists(&self, path: &Path) -> bool;

    /// Replace a file's contents in one step, or leave it untouched
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// [`VaultFs`] over the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

/// Data written and synced to a temporary file, not yet visible at its destination.
///
/// Dropping it without calling [`StagedWrite::commit`] deletes the temporary
/// file and leaves the destination as it was.
pub struct StagedWrite {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl StagedWrite {
    /// Change permissions on the staged file before it becomes visible
    pub fn set_permissions(&self, perms: Permissions) -> io::Result<()> {
        self.temp.as_file().set_permissions(perms)
    }

    /// Atomically rename the staged file over the destination
    pub fn commit(self) -> io::Result<()> {
        let dest = self.dest;
        self.temp.persist(&dest).map_err(|e| e.error)?;

        // Make the rename itself durable
        if let Ok(dir) = File::open(parent_dir(&dest)) {
            dir.sync_all().ok();
        }

        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

impl LocalFs {
    /// Write `data` to a temporary sibling of `path` and flush it to disk
    pub fn stage(&self, path: &Path, data: &[u8]) -> io::Result<StagedWrite> {
        let mut temp = tempfile::Builder::new()
            .prefix(".cloak-")
            .suffix(".tmp")
            .tempfile_in(parent_dir(path))?;

        temp.write_all(data)?;
        temp.as_file().sync_all()?;

        Ok(StagedWrite {
            temp,
            dest: path.to_path_buf(),
        })
    }
}

impl VaultFs for LocalFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.stage(path, data)?.commit()
    }
}

/// The encrypted vault file for one project
pub struct VaultStore<F = LocalFs> {
    path: PathBuf,
    fs: F,
}

impl VaultStore<LocalFs> {
    /// Open the vault at `path` on the local filesystem
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_fs(path, LocalFs)
    }
}

impl<F: VaultFs> VaultStore<F> {
    pub fn with_fs(path: impl Into<PathBuf>, fs: F) -> Self {
        Self {
            path: path.into(),
            fs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the vault file exists
    pub fn exists(&self) -> bool {
        self.fs.exists(&self.path)
    }

    /// Create a vault holding no secrets. Never overwrites an existing vault.
    pub fn init(&self, key_hex: &str) -> Result<()> {
        if self.exists() {
            return Err(Error::StoreExists(self.path.clone()));
        }
        self.save(&SecretMap::new(), key_hex)
    }

    /// Decrypt and decode the vault
    pub fn load(&self, key_hex: &str) -> Result<SecretMap> {
        let key = MasterKey::from_hex(key_hex)?;

        let envelope = match self.fs.read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::StoreNotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = Zeroizing::new(crypto::decrypt(&envelope, key.to_bytes()?.as_slice())?);
        let secrets: SecretMap =
            serde_json::from_slice(&plaintext).map_err(Error::CorruptedStore)?;

        debug!(path = %self.path.display(), count = secrets.len(), "vault loaded");
        Ok(secrets)
    }

    /// Encrypt and atomically replace the vault
    pub fn save(&self, secrets: &SecretMap, key_hex: &str) -> Result<()> {
        let key = MasterKey::from_hex(key_hex)?;

        let plaintext = Zeroizing::new(serde_json::to_vec(secrets).map_err(Error::Serialize)?);
        let envelope = crypto::encrypt(&plaintext, key.to_bytes()?.as_slice())?;
        self.fs.write_atomic(&self.path, &envelope)?;

        debug!(path = %self.path.display(), count = secrets.len(), "vault saved");
        Ok(())
    }

    /// Load, apply `change`, and save. Any failure leaves the file untouched.
    pub fn update<R>(&self, key_hex: &str, change: impl FnOnce(&mut SecretMap) -> R) -> Result<R> {
        let mut secrets = self.load(key_hex)?;
        let out = change(&mut secrets);
        self.save(&secrets, key_hex)?;
        Ok(out)
    }
}
