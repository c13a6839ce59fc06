//! Cookie-style single values over [`SharedStorage`].
//!
//! The session token lives here rather than in the vault: it is already
//! signed, and a cookie's `Max-Age` must be honoured on read no matter who
//! wrote it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{SharedStorage, StorageError};
use crate::clock::{Clock, to_delta};

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

/// Attributes written alongside a cookie value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieAttributes {
    pub path: String,
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
    pub secure: bool,
    pub same_site: SameSite,
}

impl CookieAttributes {
    /// Site-wide cookie with the given lifetime.
    #[must_use]
    pub fn site_wide(max_age: Duration, secure: bool) -> Self {
        Self {
            path: "/".to_string(),
            max_age,
            secure,
            same_site: SameSite::Lax,
        }
    }
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("malformed cookie record: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct CookieRecord {
    value: String,
    #[serde(flatten)]
    attributes: CookieAttributes,
    set_at: DateTime<Utc>,
}

/// Named cookies stored in shared storage.
#[derive(Debug, Clone)]
pub struct CookieJar {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
}

impl CookieJar {
    #[must_use]
    pub fn new(storage: Arc<dyn SharedStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Set a cookie, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `CookieError::Storage` if the write fails.
    pub fn set(&self, name: &str, value: &str, attributes: CookieAttributes) -> Result<(), CookieError> {
        let record = CookieRecord {
            value: value.to_owned(),
            attributes,
            set_at: self.clock.now(),
        };
        self.storage.put(name, serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Read a cookie. A cookie past its max age reads as absent and is removed.
    ///
    /// # Errors
    ///
    /// Returns `CookieError` if storage fails or the record is malformed.
    pub fn get(&self, name: &str) -> Result<Option<String>, CookieError> {
        let Some(stored) = self.storage.get(name)? else {
            return Ok(None);
        };
        let record: CookieRecord = serde_json::from_str(&stored.value)?;
        if self.clock.now() >= record.set_at + to_delta(record.attributes.max_age) {
            tracing::debug!(cookie = name, "dropping cookie past its max age");
            self.storage.remove(name)?;
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    /// Remove a cookie.
    ///
    /// # Errors
    ///
    /// Returns `CookieError::Storage` if the backend fails.
    pub fn remove(&self, name: &str) -> Result<(), CookieError> {
        self.storage.remove(name)?;
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
