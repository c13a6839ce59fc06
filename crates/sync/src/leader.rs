//! Leader election over a timestamped lock in shared storage.
//!
//! The lock record `{tabId, timestamp}` lives under
//! [`keys::LEADER_LOCK`](crate::storage::keys::LEADER_LOCK). A lock older than
//! the staleness threshold may be taken over by any tab. Every write is a
//! compare-and-swap against the version the writer last observed, so two tabs
//! racing for an expired lock cannot both win.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, to_delta};
use crate::message::TabId;
use crate::storage::{CasOutcome, SharedStorage, StorageError, Versioned, keys};

/// Persisted leader lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderLock {
    pub tab_id: TabId,
    pub timestamp: DateTime<Utc>,
}

/// A tab's view of whether it currently leads. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct Leadership(Arc<AtomicBool>);

impl Leadership {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Set the flag, returning the previous value.
    pub(crate) fn set(&self, leader: bool) -> bool {
        self.0.swap(leader, Ordering::AcqRel)
    }
}

/// What a heartbeat did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Leader renewed its lock.
    Renewed,
    /// Follower found the lock absent or stale and took it.
    Promoted,
    /// Leader found another tab holding the lock.
    Demoted,
    /// Follower saw a live lock held by someone else.
    Following,
}

/// Election state for one tab.
#[derive(Debug)]
pub struct LeaderElection {
    tab_id: TabId,
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    leadership: Leadership,
    /// Version of the lock record this tab last wrote.
    held_version: Mutex<Option<u64>>,
}

impl LeaderElection {
    #[must_use]
    pub fn new(
        tab_id: TabId,
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            tab_id,
            storage,
            clock,
            stale_after,
            leadership: Leadership::default(),
            held_version: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn leadership(&self) -> Leadership {
        self.leadership.clone()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Current lock holder, if the lock is present and parseable.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if storage cannot be read.
    pub fn current_leader(&self) -> Result<Option<LeaderLock>, StorageError> {
        Ok(self.read_lock()?.and_then(|(lock, _)| lock))
    }

    /// Claim the lock if it is absent or stale. Returns whether this tab now
    /// leads.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if storage fails.
    pub fn try_acquire(&self) -> Result<bool, StorageError> {
        let observed = self.read_lock()?;
        let (lock, version) = match observed {
            Some((lock, version)) => (lock, Some(version)),
            None => (None, None),
        };

        if let Some(lock) = lock {
            if lock.tab_id == self.tab_id {
                if self.held_version.lock().is_some() {
                    // Already ours; a renewal is the heartbeat's job.
                    return Ok(self.is_leader());
                }
                // Nobody replaced our record since we stepped down.
                tracing::info!(tab = %self.tab_id, "reclaiming own leader lock");
            } else if !self.is_stale(&lock) {
                tracing::debug!(tab = %self.tab_id, leader = %lock.tab_id, "lock held, following");
                return Ok(false);
            } else {
                tracing::info!(tab = %self.tab_id, previous = %lock.tab_id, "taking over stale leader lock");
            }
        }

        if self.write_lock(version)? {
            self.leadership.set(true);
            tracing::info!(tab = %self.tab_id, "became leader");
            Ok(true)
        } else {
            tracing::debug!(tab = %self.tab_id, "lost leader race");
            Ok(false)
        }
    }

    /// One heartbeat tick: renew if leading, otherwise check for an expired
    /// lock.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if storage fails.
    pub fn heartbeat(&self) -> Result<HeartbeatOutcome, StorageError> {
        if !self.is_leader() {
            return Ok(if self.try_acquire()? {
                HeartbeatOutcome::Promoted
            } else {
                HeartbeatOutcome::Following
            });
        }

        let expected = *self.held_version.lock();
        if self.write_lock(expected)? {
            tracing::trace!(tab = %self.tab_id, "renewed leader lock");
            Ok(HeartbeatOutcome::Renewed)
        } else {
            self.demote("renewal lost to another tab");
            Ok(HeartbeatOutcome::Demoted)
        }
    }

    /// React to a `LEADER_ELECTION` announcement. Returns whether this tab
    /// stepped down.
    ///
    /// A leader whose own record is still the one in storage keeps leading;
    /// the announcer will find the lock held on its next heartbeat.
    pub fn observe_announcement(&self, leader: TabId) -> bool {
        if leader == self.tab_id || !self.is_leader() {
            return false;
        }

        let held = *self.held_version.lock();
        match self.read_lock() {
            Ok(Some((Some(lock), version))) if lock.tab_id == self.tab_id && held == Some(version) => {
                tracing::warn!(tab = %self.tab_id, announced = %leader, "ignoring announcement, lock is still ours");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(tab = %self.tab_id, error = %e, "leader lock unreadable, deferring to announcement");
            }
        }
        self.demote("another tab announced leadership");
        true
    }

    /// Step down and remove the lock if it still names this tab.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if storage fails.
    pub fn release(&self) -> Result<(), StorageError> {
        let was_leader = self.leadership.set(false);
        let held = self.held_version.lock().take();

        let Some((lock, version)) = self.read_lock()? else {
            return Ok(());
        };
        let ours = lock.is_some_and(|lock| lock.tab_id == self.tab_id);
        if !ours {
            return Ok(());
        }
        // Delete exactly the record we observed; a concurrent takeover wins.
        let outcome = self.storage.compare_and_swap(keys::LEADER_LOCK, Some(version), None)?;
        if was_leader || held.is_some() {
            tracing::info!(tab = %self.tab_id, released = outcome.is_written(), "released leadership");
        }
        Ok(())
    }

    fn demote(&self, reason: &str) {
        *self.held_version.lock() = None;
        if self.leadership.set(false) {
            tracing::info!(tab = %self.tab_id, reason, "demoted to follower");
        }
    }

    fn is_stale(&self, lock: &LeaderLock) -> bool {
        self.clock.now() - lock.timestamp > to_delta(self.stale_after)
    }

    /// Read the lock record. An unparseable record is reported as `None`
    /// alongside its version so it can be overwritten.
    fn read_lock(&self) -> Result<Option<(Option<LeaderLock>, u64)>, StorageError> {
        let Some(Versioned { value, version }) = self.storage.get(keys::LEADER_LOCK)? else {
            return Ok(None);
        };
        match serde_json::from_str::<LeaderLock>(&value) {
            Ok(lock) => Ok(Some((Some(lock), version))),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed leader lock");
                Ok(Some((None, version)))
            }
        }
    }

    fn write_lock(&self, expected: Option<u64>) -> Result<bool, StorageError> {
        let record = LeaderLock {
            tab_id: self.tab_id,
            timestamp: self.clock.now(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        match self
            .storage
            .compare_and_swap(keys::LEADER_LOCK, expected, Some(value))?
        {
            CasOutcome::Written(version) => {
                *self.held_version.lock() = version;
                Ok(true)
            }
            CasOutcome::Conflict(_) => Ok(false),
        }
    }
}
