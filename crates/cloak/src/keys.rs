//! Keys - Locating the master key for a project
//!
//! Keys are namespaced by a scope derived from the project directory, so
//! every project gets its own master key. Lookup order:
//!
//! 1. The environment override (e.g. `CLOAK_MASTER_KEY`), if non-empty
//! 2. The OS keyring, under the project's scope
//! 3. The fallback key store file, under the same scope
//!
//! The fallback store keeps keys as cleartext JSON protected only by
//! owner-only file permissions. This is an accepted risk of running without
//! a usable keyring; every write to it is logged at warn level.

use cloak_core::{Config, Paths};
use fs4::fs_std::FileExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::crypto::MasterKey;
use crate::error::{Error, Result};
use crate::vault::LocalFs;

/// Compute the scope identifier for a project directory.
///
/// The path is canonicalized when it exists and made absolute otherwise.
/// The result is `project-` followed by the first 16 hex characters of the
/// SHA-256 of that path's raw bytes.
pub fn compute_scope(path: &Path) -> Result<String> {
    let resolved = match fs::canonicalize(path) {
        Ok(p) => p,
        Err(_) => std::path::absolute(path)?,
    };

    let digest = Sha256::digest(resolved.as_os_str().as_encoded_bytes());
    let hex = hex::encode(digest);
    Ok(format!("project-{}", &hex[..16]))
}

/// A secure credential service offered by the OS
pub trait CredentialStore: Send + Sync {
    /// Return the backend name
    fn name(&self) -> &str;

    /// Fetch a secret; `Ok(None)` when no entry exists
    fn get(&self, service: &str, account: &str) -> Result<Option<String>>;

    /// Create or overwrite a secret
    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()>;

    /// Remove a secret; a missing entry is not an error
    fn delete(&self, service: &str, account: &str) -> Result<()>;
}

/// OS keyring backend (Keychain, Credential Manager, Secret Service)
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

fn unavailable(err: keyring::Error) -> Error {
    Error::BackendUnavailable(err.to_string())
}

impl CredentialStore for KeyringStore {
    fn name(&self) -> &str {
        "keyring"
    }

    fn get(&self, service: &str, account: &str) -> Result<Option<String>> {
        let entry = keyring::Entry::new(service, account).map_err(unavailable)?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, account).map_err(unavailable)?;
        entry.set_password(secret).map_err(unavailable)
    }

    fn delete(&self, service: &str, account: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, account).map_err(unavailable)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

/// File-backed scope → key map used when the keyring cannot be.
///
/// Every mutation rewrites the whole file. Within a process the
/// read-modify-write span is serialized by a mutex; across processes by an
/// advisory lock on a sibling `.lock` file.
pub struct FallbackKeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FallbackKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Look up the key stored for a scope
    pub fn get(&self, scope: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_entries()?.remove(scope))
    }

    /// Insert or overwrite the key for a scope, creating the file if needed
    pub fn insert(&self, scope: &str, key_hex: &str) -> Result<()> {
        self.modify(|entries| {
            entries.insert(scope.to_string(), key_hex.to_string());
            ((), true)
        })
    }

    /// Remove the key for a scope. Returns whether an entry existed.
    ///
    /// The file is only rewritten when an entry was actually removed.
    pub fn remove(&self, scope: &str) -> Result<bool> {
        self.modify(|entries| {
            let removed = entries.remove(scope).is_some();
            (removed, removed)
        })
    }

    /// Every stored scope and key
    pub fn load_all(&self) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_entries()
    }

    /// Read-modify-write under both locks. `change` reports whether the
    /// entries need writing back.
    fn modify<R>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> (R, bool),
    ) -> Result<R> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_dir()?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        // Released when lock_file is dropped
        lock_file.lock_exclusive()?;

        let mut entries = self.read_entries()?;
        let (out, changed) = change(&mut entries);
        if changed {
            self.write_entries(&entries)?;
        }
        Ok(out)
    }

    fn ensure_dir(&self) -> io::Result<()> {
        let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };

        if !dir.exists() {
            fs::create_dir_all(dir)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }

        Ok(())
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(&self.path) {
                if meta.permissions().mode() & 0o077 != 0 {
                    warn!(path = %self.path.display(), "fallback key store is readable by other users");
                }
            }
        }

        serde_json::from_slice(&content).map_err(|source| Error::CorruptedKeyStore {
            path: self.path.clone(),
            source,
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_vec_pretty(entries).map_err(Error::Serialize)?;
        let staged = LocalFs.stage(&self.path, &content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            staged.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        staged.commit()?;
        Ok(())
    }
}

/// Where [`KeyResolver::store`] put a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLocation {
    Keyring,
    Fallback(PathBuf),
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyLocation::Keyring => write!(f, "system keyring"),
            KeyLocation::Fallback(path) => write!(f, "fallback file {}", path.display()),
        }
    }
}

/// Resolves, stores and forgets per-project master keys
pub struct KeyResolver {
    credentials: Box<dyn CredentialStore>,
    fallback: FallbackKeyStore,
    service: String,
    env_override: Option<String>,
}

impl KeyResolver {
    pub fn new(
        credentials: Box<dyn CredentialStore>,
        fallback: FallbackKeyStore,
        service: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            fallback,
            service: service.into(),
            env_override: None,
        }
    }

    /// Resolver wired to the OS keyring, the configured fallback file and
    /// the configured environment variable
    pub fn from_config(config: &Config, paths: &Paths) -> Self {
        Self::new(
            Box::new(KeyringStore),
            FallbackKeyStore::new(config.fallback_path(paths)),
            config.keyring_service.clone(),
        )
        .with_env_override(std::env::var(&config.env_var).ok())
    }

    /// Set the value that short-circuits every other backend
    pub fn with_env_override(mut self, value: Option<String>) -> Self {
        self.env_override = value;
        self
    }

    /// Scope identifier for a project directory
    pub fn scope(&self, path: &Path) -> Result<String> {
        compute_scope(path)
    }

    /// Find the master key for a project directory
    pub fn resolve(&self, path: &Path) -> Result<MasterKey> {
        if let Some(value) = self.env_override.as_deref() {
            if !value.is_empty() {
                debug!("using master key from environment override");
                return MasterKey::from_hex(value);
            }
        }

        let scope = compute_scope(path)?;

        match self.credentials.get(&self.service, &scope) {
            Ok(Some(secret)) if !secret.is_empty() => {
                debug!(%scope, backend = self.credentials.name(), "master key found");
                return MasterKey::from_hex(&secret);
            }
            Ok(_) => debug!(%scope, backend = self.credentials.name(), "no master key entry"),
            Err(Error::BackendUnavailable(reason)) => {
                debug!(%scope, %reason, "credential backend unavailable, trying fallback store");
            }
            Err(e) => return Err(e),
        }

        if let Some(secret) = self.fallback.get(&scope)? {
            debug!(%scope, path = %self.fallback.path().display(), "master key found in fallback store");
            return MasterKey::from_hex(&secret);
        }

        Err(Error::KeyNotFound { scope })
    }

    /// Save the master key for a project directory
    pub fn store(&self, path: &Path, key: &MasterKey) -> Result<KeyLocation> {
        let scope = compute_scope(path)?;

        match self.credentials.set(&self.service, &scope, key.as_hex()) {
            Ok(()) => {
                debug!(%scope, backend = self.credentials.name(), "master key stored");
                Ok(KeyLocation::Keyring)
            }
            Err(err) => {
                warn!(
                    %scope,
                    error = %err,
                    path = %self.fallback.path().display(),
                    "keyring unavailable, storing master key in cleartext fallback file"
                );
                self.fallback.insert(&scope, key.as_hex())?;
                Ok(KeyLocation::Fallback(self.fallback.path().to_path_buf()))
            }
        }
    }

    /// Remove the master key for a project directory from every backend
    pub fn forget(&self, path: &Path) -> Result<()> {
        let scope = compute_scope(path)?;

        if let Err(err) = self.credentials.delete(&self.service, &scope) {
            warn!(%scope, error = %err, "failed to remove master key from keyring");
        }

        if self.fallback.remove(&scope)? {
            debug!(%scope, "master key removed from fallback store");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const KEY_A: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_B: &str = "0000000000000000000000000000000000000000000000000000000000000002";

    /// In-memory credential store that can pretend to be unavailable
    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<(String, String), String>>,
        unavailable: bool,
    }

    impl MemoryStore {
        fn unavailable() -> Self {
            Self {
                unavailable: true,
                ..Default::default()
            }
        }

        fn check(&self) -> Result<()> {
            if self.unavailable {
                return Err(Error::BackendUnavailable("no keyring in test".to_string()));
            }
            Ok(())
        }
    }

    impl CredentialStore for MemoryStore {
        fn name(&self) -> &str {
            "memory"
        }

        fn get(&self, service: &str, account: &str) -> Result<Option<String>> {
            self.check()?;
            let entries = self.entries.lock().unwrap();
            Ok(entries.get(&(service.to_string(), account.to_string())).cloned())
        }

        fn set(&self, service: &str, account: &str, secret: &str) -> Result<()> {
            self.check()?;
            let mut entries = self.entries.lock().unwrap();
            entries.insert((service.to_string(), account.to_string()), secret.to_string());
            Ok(())
        }

        fn delete(&self, service: &str, account: &str) -> Result<()> {
            self.check()?;
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&(service.to_string(), account.to_string()));
            Ok(())
        }
    }

    fn resolver(store: MemoryStore, fallback: &Path) -> KeyResolver {
        KeyResolver::new(Box::new(store), FallbackKeyStore::new(fallback), "cloak-test")
    }

    fn key(hex: &str) -> MasterKey {
        MasterKey::from_hex(hex).unwrap()
    }

    #[test]
    fn test_scope_is_deterministic() {
        let dir = tempdir().unwrap();
        let a = compute_scope(dir.path()).unwrap();
        let b = compute_scope(dir.path()).unwrap();

        assert_eq!(a, b);
        assert!(a.starts_with("project-"));
        assert_eq!(a.len(), "project-".len() + 16);
        assert!(a["project-".len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_scope_differs_between_directories() {
        let root = tempdir().unwrap();
        let mut scopes = std::collections::HashSet::new();
        for i in 0..50 {
            let dir = root.path().join(format!("project{}", i));
            fs::create_dir(&dir).unwrap();
            assert!(scopes.insert(compute_scope(&dir).unwrap()));
        }
    }

    #[test]
    fn test_scope_canonicalizes_path() {
        let root = tempdir().unwrap();
        let dir = root.path().join("app");
        fs::create_dir(&dir).unwrap();

        let dotted = root.path().join("app").join("..").join("app");
        assert_eq!(compute_scope(&dir).unwrap(), compute_scope(&dotted).unwrap());
    }

    #[test]
    fn test_scope_of_missing_path() {
        let root = tempdir().unwrap();
        let missing = root.path().join("does-not-exist");
        assert_eq!(
            compute_scope(&missing).unwrap(),
            compute_scope(&missing).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_scope_distinguishes_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = tempdir().unwrap();
        let first = root.path().join(OsStr::from_bytes(b"proj\xff"));
        let second = root.path().join(OsStr::from_bytes(b"proj\xfe"));

        // Not every filesystem accepts invalid UTF-8 names
        if fs::create_dir(&first).is_err() || fs::create_dir(&second).is_err() {
            return;
        }

        assert_ne!(
            compute_scope(&first).unwrap(),
            compute_scope(&second).unwrap()
        );
    }

    #[test]
    fn test_env_override_wins() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::default();
        let scope = compute_scope(dir.path()).unwrap();
        store.set("cloak-test", &scope, KEY_B).unwrap();

        let resolver = resolver(store, &dir.path().join("keys.json"))
            .with_env_override(Some(KEY_A.to_string()));
        assert_eq!(resolver.resolve(dir.path()).unwrap(), key(KEY_A));
    }

    #[test]
    fn test_empty_env_override_is_ignored() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::default();
        let scope = compute_scope(dir.path()).unwrap();
        store.set("cloak-test", &scope, KEY_B).unwrap();

        let resolver =
            resolver(store, &dir.path().join("keys.json")).with_env_override(Some(String::new()));
        assert_eq!(resolver.resolve(dir.path()).unwrap(), key(KEY_B));
    }

    #[test]
    fn test_whitespace_env_override_is_not_skipped() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::default();
        let scope = compute_scope(dir.path()).unwrap();
        store.set("cloak-test", &scope, KEY_B).unwrap();

        let resolver = resolver(store, &dir.path().join("keys.json"))
            .with_env_override(Some("  ".to_string()));
        assert!(matches!(
            resolver.resolve(dir.path()),
            Err(Error::InvalidKeyFormat)
        ));
    }

    #[test]
    fn test_malformed_env_override_is_rejected() {
        let dir = tempdir().unwrap();
        let resolver = resolver(MemoryStore::default(), &dir.path().join("keys.json"))
            .with_env_override(Some("hunter2".to_string()));
        assert!(matches!(
            resolver.resolve(dir.path()),
            Err(Error::InvalidKeyFormat)
        ));
    }

    #[test]
    fn test_store_and_resolve_through_keyring() {
        let dir = tempdir().unwrap();
        let fallback = dir.path().join("home").join("keys.json");
        let resolver = resolver(MemoryStore::default(), &fallback);

        let location = resolver.store(dir.path(), &key(KEY_A)).unwrap();
        assert_eq!(location, KeyLocation::Keyring);
        assert_eq!(resolver.resolve(dir.path()).unwrap(), key(KEY_A));

        // Fallback file is only created when it is needed
        assert!(!fallback.exists());
    }

    #[test]
    fn test_unavailable_keyring_falls_back_to_file() {
        let dir = tempdir().unwrap();
        let fallback = dir.path().join("home").join("keys.json");
        let resolver = resolver(MemoryStore::unavailable(), &fallback);

        let location = resolver.store(dir.path(), &key(KEY_A)).unwrap();
        assert_eq!(location, KeyLocation::Fallback(fallback.clone()));
        assert_eq!(resolver.resolve(dir.path()).unwrap(), key(KEY_A));

        let on_disk: BTreeMap<String, String> =
            serde_json::from_slice(&fs::read(&fallback).unwrap()).unwrap();
        assert_eq!(on_disk.get(&compute_scope(dir.path()).unwrap()).unwrap(), KEY_A);
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let fallback = dir.path().join("home").join("keys.json");
        let store = FallbackKeyStore::new(&fallback);
        store.insert("project-0123456789abcdef", KEY_A).unwrap();

        let file_mode = fs::metadata(&fallback).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = fs::metadata(fallback.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_fallback_store_keeps_other_scopes() {
        let dir = tempdir().unwrap();
        let store = FallbackKeyStore::new(dir.path().join("keys.json"));

        store.insert("project-aaaaaaaaaaaaaaaa", KEY_A).unwrap();
        store.insert("project-bbbbbbbbbbbbbbbb", KEY_B).unwrap();
        store.insert("project-aaaaaaaaaaaaaaaa", KEY_B).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["project-aaaaaaaaaaaaaaaa"], KEY_B);

        assert!(store.remove("project-aaaaaaaaaaaaaaaa").unwrap());
        assert!(!store.remove("project-aaaaaaaaaaaaaaaa").unwrap());
        assert_eq!(store.get("project-bbbbbbbbbbbbbbbb").unwrap().as_deref(), Some(KEY_B));
        assert_eq!(store.get("project-aaaaaaaaaaaaaaaa").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_removing_unknown_scope_leaves_file_alone() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = FallbackKeyStore::new(&path);
        store.insert("project-aaaaaaaaaaaaaaaa", KEY_A).unwrap();

        // A rewrite would reset the mode to 0600
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        assert!(!store.remove("project-bbbbbbbbbbbbbbbb").unwrap());
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o640);
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_from_missing_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = FallbackKeyStore::new(&path);

        assert!(!store.remove("project-aaaaaaaaaaaaaaaa").unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_fallback_store_concurrent_inserts() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FallbackKeyStore::new(dir.path().join("keys.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.insert(&format!("project-{:016x}", i), KEY_A).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.load_all().unwrap().len(), 8);
    }

    #[test]
    fn test_corrupted_fallback_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FallbackKeyStore::new(&path);
        assert!(matches!(
            store.get("project-0000000000000000"),
            Err(Error::CorruptedKeyStore { .. })
        ));
    }

    #[test]
    fn test_key_not_found() {
        let dir = tempdir().unwrap();
        let resolver = resolver(MemoryStore::unavailable(), &dir.path().join("keys.json"));

        match resolver.resolve(dir.path()) {
            Err(Error::KeyNotFound { scope }) => {
                assert_eq!(scope, compute_scope(dir.path()).unwrap());
            }
            other => panic!("expected KeyNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_keys_are_scoped_per_directory() {
        let root = tempdir().unwrap();
        let one = root.path().join("one");
        let two = root.path().join("two");
        fs::create_dir(&one).unwrap();
        fs::create_dir(&two).unwrap();

        let resolver = resolver(MemoryStore::default(), &root.path().join("keys.json"));
        resolver.store(&one, &key(KEY_A)).unwrap();
        resolver.store(&two, &key(KEY_B)).unwrap();

        assert_eq!(resolver.resolve(&one).unwrap(), key(KEY_A));
        assert_eq!(resolver.resolve(&two).unwrap(), key(KEY_B));
    }

    #[test]
    fn test_forget_removes_from_both_backends() {
        let dir = tempdir().unwrap();
        let fallback = dir.path().join("keys.json");
        let scope = compute_scope(dir.path()).unwrap();

        let store = MemoryStore::default();
        store.set("cloak-test", &scope, KEY_A).unwrap();
        FallbackKeyStore::new(&fallback).insert(&scope, KEY_B).unwrap();

        let resolver = resolver(store, &fallback);
        resolver.forget(dir.path()).unwrap();

        assert!(matches!(
            resolver.resolve(dir.path()),
            Err(Error::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_forget_when_nothing_is_stored() {
        let dir = tempdir().unwrap();
        let fallback = dir.path().join("keys.json");

        resolver(MemoryStore::default(), &fallback)
            .forget(dir.path())
            .unwrap();
        resolver(MemoryStore::unavailable(), &fallback)
            .forget(dir.path())
            .unwrap();

        assert!(!fallback.exists());
    }
}
