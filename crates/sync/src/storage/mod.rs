//! Origin-wide persistent key-value storage.
//!
//! Every tab of an origin sees the same [`SharedStorage`]. Values carry a
//! version that changes on every write, which is what makes
//! [`SharedStorage::compare_and_swap`] possible: the leader lock is never
//! written blind.
//!
//! # Submodules
//!
//! - [`vault`] - Encrypted items and temporary items with a TTL
//! - [`cookie`] - Cookie-style single values with path/max-age attributes

pub mod cookie;
pub mod vault;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

pub use cookie::{CookieAttributes, CookieError, CookieJar, SameSite};
pub use vault::{Vault, VaultError};

/// Storage keys shared by every tab.
pub mod keys {
    /// Persisted cart snapshot (stored through the vault).
    pub const CART: &str = "cart-storage";

    /// Leader lock record.
    pub const LEADER_LOCK: &str = "tab-leader";

    /// Signed session token cookie.
    pub const AUTH_TOKEN: &str = "auth-token";
}

/// Errors raised by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Writing would exceed the backend's byte quota.
    #[error("storage quota exceeded ({used} of {quota} bytes used)")]
    QuotaExceeded { used: usize, quota: usize },

    /// The backend cannot be reached at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A stored value with the version assigned by the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write happened; carries the new version (`None` after a delete).
    Written(Option<u64>),
    /// Another writer got there first; carries the version actually present.
    Conflict(Option<u64>),
}

impl CasOutcome {
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

/// Persistent storage shared by all tabs of an origin.
pub trait SharedStorage: Send + Sync + fmt::Debug {
    /// Read a value and its version.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError>;

    /// Unconditionally write a value, returning its new version.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::QuotaExceeded` if the value does not fit.
    fn put(&self, key: &str, value: String) -> Result<u64, StorageError>;

    /// Write (`Some`) or delete (`None`) a value only if the current version
    /// matches `expected` (`None` meaning "absent").
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails; a lost race is reported
    /// as `Ok(CasOutcome::Conflict(..))`, not as an error.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<String>,
    ) -> Result<CasOutcome, StorageError>;

    /// Delete a value. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List keys starting with `prefix`, in lexical order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory [`SharedStorage`]. Clones share the same underlying map, so one
/// instance handed to several tabs behaves like one origin's storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: RwLock<BTreeMap<String, Versioned>>,
    next_version: AtomicU64,
    quota: Option<usize>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes once keys plus values exceed `bytes`.
    #[must_use]
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                quota: Some(bytes),
                ..MemoryInner::default()
            }),
        }
    }

    /// Bytes currently used by keys and values.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        used_bytes(&self.inner.entries.read())
    }

    fn bump_version(&self) -> u64 {
        self.inner.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_quota(
        &self,
        entries: &BTreeMap<String, Versioned>,
        key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let Some(quota) = self.inner.quota else {
            return Ok(());
        };
        let replaced = entries
            .get(key)
            .map_or(0, |old| key.len() + old.value.len());
        let used = used_bytes(entries) - replaced + key.len() + value.len();
        if used > quota {
            return Err(StorageError::QuotaExceeded { used, quota });
        }
        Ok(())
    }
}

fn used_bytes(entries: &BTreeMap<String, Versioned>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.value.len()).sum()
}

impl SharedStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        Ok(self.inner.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<u64, StorageError> {
        let mut entries = self.inner.entries.write();
        self.check_quota(&entries, key, &value)?;
        let version = self.bump_version();
        entries.insert(key.to_owned(), Versioned { value, version });
        Ok(version)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<String>,
    ) -> Result<CasOutcome, StorageError> {
        let mut entries = self.inner.entries.write();
        let current = entries.get(key).map(|v| v.version);
        if current != expected {
            return Ok(CasOutcome::Conflict(current));
        }

        match value {
            Some(value) => {
                self.check_quota(&entries, key, &value)?;
                let version = self.bump_version();
                entries.insert(key.to_owned(), Versioned { value, version });
                Ok(CasOutcome::Written(Some(version)))
            }
            None => {
                entries.remove(key);
                Ok(CasOutcome::Written(None))
            }
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
