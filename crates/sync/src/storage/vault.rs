//! Encrypted items over [`SharedStorage`].
//!
//! Values are sealed with AES-256-GCM under a key derived (SHA-256) from the
//! configured storage secret and stored as base64 `nonce || ciphertext`
//! under a `secure_` prefixed key. Temporary items wrap the value with an
//! expiry and are evicted the first time they are read after it.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{SharedStorage, StorageError};
use crate::clock::{Clock, to_delta};

/// Prefix for every key written by the vault.
pub const VAULT_PREFIX: &str = "secure_";

const NONCE_LEN: usize = 12;

/// Errors raised while sealing or opening vault items.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("encryption failed")]
    Encrypt,

    /// Wrong key, truncated or tampered ciphertext.
    #[error("decryption failed")]
    Decrypt,

    #[error("invalid encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct TemporaryItem<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// Encrypted view over shared storage.
#[derive(Clone)]
pub struct Vault {
    storage: Arc<dyn SharedStorage>,
    cipher: Aes256Gcm,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("storage", &self.storage)
            .field("cipher", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Create a vault keyed by `secret`.
    #[must_use]
    pub fn new(storage: Arc<dyn SharedStorage>, secret: &SecretString, clock: Arc<dyn Clock>) -> Self {
        let key = Sha256::digest(secret.expose_secret().as_bytes());
        let cipher = Aes256Gcm::new(&key);
        Self {
            storage,
            cipher,
            clock,
        }
    }

    /// Seal and store a plaintext string.
    ///
    /// # Errors
    ///
    /// Returns `VaultError` if encryption or the storage write fails.
    pub fn set_item(&self, key: &str, plaintext: &str) -> Result<(), VaultError> {
        let sealed = self.seal(plaintext.as_bytes())?;
        self.storage.put(&storage_key(key), sealed)?;
        Ok(())
    }

    /// Read and open a stored string.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Decrypt` if the item was sealed with another key
    /// or tampered with.
    pub fn get_item(&self, key: &str) -> Result<Option<String>, VaultError> {
        let Some(stored) = self.storage.get(&storage_key(key))? else {
            return Ok(None);
        };
        let plaintext = self.open(&stored.value)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| VaultError::Decrypt)
    }

    /// Serialize `value` as JSON and store it sealed.
    ///
    /// # Errors
    ///
    /// Returns `VaultError` if serialization, encryption or storage fails.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), VaultError> {
        self.set_item(key, &serde_json::to_string(value)?)
    }

    /// Read a sealed JSON item as an untyped value.
    ///
    /// # Errors
    ///
    /// Returns `VaultError` if the item cannot be opened or parsed.
    pub fn get_raw_json(&self, key: &str) -> Result<Option<serde_json::Value>, VaultError> {
        match self.get_item(key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Read a sealed JSON item.
    ///
    /// # Errors
    ///
    /// Returns `VaultError` if the item cannot be opened or parsed as `T`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, VaultError> {
        match self.get_item(key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Delete an item.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Storage` if the backend fails.
    pub fn remove_item(&self, key: &str) -> Result<(), VaultError> {
        self.storage.remove(&storage_key(key))?;
        Ok(())
    }

    /// Delete every vault item. Keys written outside the vault are untouched.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Storage` if the backend fails.
    pub fn clear(&self) -> Result<usize, VaultError> {
        let keys = self.storage.keys(VAULT_PREFIX)?;
        for key in &keys {
            self.storage.remove(key)?;
        }
        Ok(keys.len())
    }

    /// Store `value` until `ttl` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `VaultError` if serialization, encryption or storage fails.
    pub fn set_temporary<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: std::time::Duration,
    ) -> Result<(), VaultError> {
        let item = TemporaryItem {
            value,
            expires_at: self.clock.now() + to_delta(ttl),
        };
        self.set_json(key, &item)
    }

    /// Read a temporary item, evicting it if it has expired.
    ///
    /// # Errors
    ///
    /// Returns `VaultError` if the item cannot be opened or parsed.
    pub fn get_temporary<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, VaultError> {
        let Some(item) = self.get_json::<TemporaryItem<T>>(key)? else {
            return Ok(None);
        };
        if item.expires_at <= self.clock.now() {
            tracing::debug!(key, "evicting expired temporary item");
            self.remove_item(key)?;
            return Ok(None);
        }
        Ok(Some(item.value))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| VaultError::Encrypt)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    fn open(&self, sealed: &str) -> Result<Vec<u8>, VaultError> {
        let framed = STANDARD.decode(sealed)?;
        if framed.len() < NONCE_LEN {
            return Err(VaultError::Decrypt);
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decrypt)
    }
}

fn storage_key(key: &str) -> String {
    format!("{VAULT_PREFIX}{key}")
}
