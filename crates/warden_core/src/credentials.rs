//! Private key storage behind opaque handles.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::debug;
use warden_exec::PrivateKey;

use crate::cipher::KeyCipher;
use crate::config::WardenConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::SecretHandle;

/// Resolves credential handles to key material.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    /// Key material for `handle`.
    fn resolve(&self, handle: &SecretHandle) -> CoreResult<PrivateKey>;

    /// Store (or replace) the key behind `handle`.
    fn store(&self, handle: &SecretHandle, key: &PrivateKey) -> CoreResult<()>;

    /// Forget `handle`. Missing handles are not an error.
    fn remove(&self, handle: &SecretHandle) -> CoreResult<()>;
}

/// One sealed key file per handle under a directory.
///
/// Files are created owner-only and hold AES-GCM ciphertext, never the
/// raw key.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
    cipher: KeyCipher,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>, cipher: KeyCipher) -> Self {
        Self {
            dir: dir.into(),
            cipher,
        }
    }

    /// Store under the configured keys directory.
    ///
    /// The cipher comes from `encryption_key` when set, otherwise from the
    /// master key file in the data directory.
    pub fn from_config(config: &WardenConfig) -> CoreResult<Self> {
        let cipher = match &config.encryption_key {
            Some(passphrase) => KeyCipher::from_passphrase(passphrase)?,
            None => KeyCipher::load_or_create(&config.master_key_path())?,
        };
        Ok(Self::new(config.keys_dir(), cipher))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, handle: &SecretHandle) -> CoreResult<PathBuf> {
        validate_handle(handle)?;
        Ok(self.dir.join(format!("{}.key", handle.as_str())))
    }
}

impl CredentialStore for FileCredentialStore {
    fn resolve(&self, handle: &SecretHandle) -> CoreResult<PrivateKey> {
        let path = self.key_path(handle)?;
        let sealed = fs::read_to_string(&path).map_err(|e| {
            CoreError::Credential(format!("cannot read key for {}: {}", handle.as_str(), e))
        })?;
        let material = self.cipher.open(&sealed).map_err(|e| {
            CoreError::Credential(format!("cannot unseal key for {}: {}", handle.as_str(), e))
        })?;
        let key = PrivateKey::new(material);
        if key.is_empty() {
            return Err(CoreError::Credential(format!(
                "key for {} is empty",
                handle.as_str()
            )));
        }
        Ok(key)
    }

    fn store(&self, handle: &SecretHandle, key: &PrivateKey) -> CoreResult<()> {
        if key.is_empty() {
            return Err(CoreError::Credential("refusing to store an empty key".into()));
        }
        let path = self.key_path(handle)?;
        let sealed = self.cipher.seal(key.expose())?;

        // The temp file is created 0600, so the key is never readable by others.
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(sealed.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!("Stored key for handle {}", handle.as_str());
        Ok(())
    }

    fn remove(&self, handle: &SecretHandle) -> CoreResult<()> {
        let path = self.key_path(handle)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handles become file names, so keep them to a safe alphabet.
fn validate_handle(handle: &SecretHandle) -> CoreResult<()> {
    let h = handle.as_str();
    let valid = !h.is_empty()
        && !h.starts_with('.')
        && h
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(CoreError::Credential(format!("invalid credential handle: {:?}", h)));
    }
    Ok(())
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    keys: RwLock<HashMap<SecretHandle, PrivateKey>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, handle: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys
            .write()
            .insert(SecretHandle::new(handle), PrivateKey::new(key));
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn resolve(&self, handle: &SecretHandle) -> CoreResult<PrivateKey> {
        self.keys
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| CoreError::Credential(format!("no key for {}", handle.as_str())))
    }

    fn store(&self, handle: &SecretHandle, key: &PrivateKey) -> CoreResult<()> {
        self.keys.write().insert(handle.clone(), key.clone());
        Ok(())
    }

    fn remove(&self, handle: &SecretHandle) -> CoreResult<()> {
        self.keys.write().remove(handle);
        Ok(())
    }
}
