//! At-rest encryption for stored private keys.
//!
//! AES-256-GCM with a fresh 12-byte nonce per write. The sealed form is
//! `warden:v1:` followed by base64 of nonce and ciphertext.

use std::fmt;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{CoreError, CoreResult};

const SEALED_PREFIX: &str = "warden:v1:";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Symmetric cipher for key material.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyCipher(<redacted>)")
    }
}

impl KeyCipher {
    /// Derive the 256-bit key as the SHA-256 of `passphrase`.
    pub fn from_passphrase(passphrase: &str) -> CoreResult<Self> {
        if passphrase.is_empty() {
            return Err(CoreError::Config("encryption key must not be empty".into()));
        }
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let key: [u8; KEY_LEN] = hasher.finalize().into();
        Ok(Self::from_key(key))
    }

    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Load the master key at `path`, generating it on first use.
    ///
    /// The file is created with owner-only permissions. When two processes
    /// race, the first persisted key wins and both use it.
    pub fn load_or_create(path: &Path) -> CoreResult<Self> {
        match fs::read_to_string(path) {
            Ok(encoded) => return Self::decode_key_file(path, &encoded),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::Credential(format!(
                    "cannot read master key {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(STANDARD.encode(key).as_bytes())?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(path) {
            Ok(_) => {
                info!("Generated master key at {}", path.display());
                Ok(Self::from_key(key))
            }
            Err(e) if e.error.kind() == IoErrorKind::AlreadyExists => {
                let encoded = fs::read_to_string(path)?;
                Self::decode_key_file(path, &encoded)
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn decode_key_file(path: &Path, encoded: &str) -> CoreResult<Self> {
        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            CoreError::Credential(format!("master key {} is corrupt: {}", path.display(), e))
        })?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CoreError::Credential(format!("master key {} has the wrong length", path.display()))
        })?;
        Ok(Self::from_key(key))
    }

    pub fn seal(&self, plaintext: &str) -> CoreResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CoreError::Credential(format!("encryption failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(sealed)))
    }

    pub fn open(&self, sealed: &str) -> CoreResult<String> {
        let encoded = sealed
            .trim()
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| CoreError::Credential("key is not in the sealed format".into()))?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| CoreError::Credential(format!("sealed key is corrupt: {}", e)))?;
        if data.len() < NONCE_LEN {
            return Err(CoreError::Credential("sealed key is truncated".into()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CoreError::Credential("wrong encryption key or tampered file".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CoreError::Credential(format!("decrypted key is not UTF-8: {}", e)))
    }
}

/// True when `contents` carries the sealed prefix.
pub fn is_sealed(contents: &str) -> bool {
    contents.trim_start().starts_with(SEALED_PREFIX)
}
