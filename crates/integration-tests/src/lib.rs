//! Integration tests for GeekWear tab sync.
//!
//! Every test builds a [`TestOrigin`]: in-memory shared storage, a local
//! broadcast hub, the in-memory identity provider and a manual clock. Tabs
//! opened from it behave like browser tabs of one site.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p geekwear-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `multi_tab` - Election, failover and cart propagation
//! - `auth_sync` - Sign-in, sign-out and token propagation

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use geekwear_core::{Email, Money, ProductId, ProductSnapshot};
use geekwear_sync::auth::{InMemoryIdentityProvider, PrivilegedAdmins, ProviderUser};
use geekwear_sync::channel::BroadcastHub;
use geekwear_sync::clock::{Clock, ManualClock, to_delta};
use geekwear_sync::leader::HeartbeatOutcome;
use geekwear_sync::storage::{MemoryStorage, SharedStorage};
use geekwear_sync::{Origin, SyncConfig, SyncError, Tab};

pub type TestTab = Tab<InMemoryIdentityProvider>;

/// Password used for every account created through [`TestOrigin::account`].
pub const TEST_PASSWORD: &str = "it's-dangerous-to-go-alone";

/// Shared collaborators of one simulated origin.
pub struct TestOrigin {
    pub clock: ManualClock,
    pub storage: Arc<MemoryStorage>,
    pub provider: Arc<InMemoryIdentityProvider>,
    pub config: Arc<SyncConfig>,
    origin: Origin<InMemoryIdentityProvider>,
}

impl TestOrigin {
    /// An origin with default settings and throwaway secrets.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SyncConfig::ephemeral())
    }

    #[must_use]
    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_hub(config, BroadcastHub::new())
    }

    /// An origin whose tabs share storage but cannot broadcast.
    #[must_use]
    pub fn without_broadcast() -> Self {
        Self::with_hub(SyncConfig::ephemeral(), BroadcastHub::unsupported())
    }

    fn with_hub(config: SyncConfig, hub: BroadcastHub) -> Self {
        let clock = ManualClock::starting_now();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let storage = Arc::new(MemoryStorage::new());
        let provider = Arc::new(InMemoryIdentityProvider::new(Arc::clone(&shared_clock)));
        let origin = Origin {
            storage: Arc::clone(&storage) as Arc<dyn SharedStorage>,
            hub,
            provider: Arc::clone(&provider),
            clock: shared_clock,
            admin: Arc::new(PrivilegedAdmins::new(&config.privileged_emails)),
        };
        Self {
            clock,
            storage,
            provider,
            config: Arc::new(config),
            origin,
        }
    }

    #[must_use]
    pub fn origin(&self) -> &Origin<InMemoryIdentityProvider> {
        &self.origin
    }

    /// Open a tab without booting it.
    #[must_use]
    pub fn open(&self) -> TestTab {
        Tab::open(&self.origin, Arc::clone(&self.config))
    }

    /// Open and boot `count` tabs in order, then deliver the announcements.
    /// The first tab becomes leader.
    ///
    /// # Errors
    ///
    /// Returns `SyncError` if a tab fails to boot.
    pub async fn boot_tabs(&self, count: usize) -> Result<Vec<TestTab>, SyncError> {
        let mut tabs = Vec::with_capacity(count);
        for _ in 0..count {
            let tab = self.open();
            tab.boot().await?;
            tabs.push(tab);
        }
        settle(&tabs).await;
        Ok(tabs)
    }

    /// Register an account with [`TEST_PASSWORD`].
    ///
    /// # Panics
    ///
    /// Panics if the email is invalid or already registered.
    #[allow(clippy::unwrap_used)]
    pub fn account(&self, email: &str, name: &str, role: Option<&str>) -> ProviderUser {
        let email = Email::parse(email).unwrap();
        self.provider.add_account(&email, TEST_PASSWORD, Some(name), role).unwrap()
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(to_delta(duration));
    }

    /// Move the clock just past the leader staleness threshold.
    pub fn age_leader_lock(&self) {
        self.clock
            .advance(to_delta(self.config.leader_stale_after) + TimeDelta::milliseconds(1));
    }
}

impl Default for TestOrigin {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver queued messages and provider events until every tab is quiet.
pub async fn settle(tabs: &[TestTab]) {
    loop {
        let mut handled = 0;
        for tab in tabs {
            handled += tab.process_pending().await;
        }
        if handled == 0 {
            break;
        }
    }
}

/// Heartbeat every tab once, in order.
///
/// # Errors
///
/// Returns `SyncError` if a heartbeat cannot reach storage.
pub async fn heartbeat_all(tabs: &[TestTab]) -> Result<Vec<HeartbeatOutcome>, SyncError> {
    let mut outcomes = Vec::with_capacity(tabs.len());
    for tab in tabs {
        outcomes.push(tab.heartbeat().await?);
    }
    Ok(outcomes)
}

/// Number of tabs that consider themselves leader.
#[must_use]
pub fn leader_count(tabs: &[TestTab]) -> usize {
    tabs.iter().filter(|tab| tab.is_leader()).count()
}

/// Poll `check` until it holds, sleeping between attempts. Intended for
/// tests running on paused tokio time.
///
/// # Panics
///
/// Panics if `check` still fails after `attempts` polls.
pub async fn eventually<F, Fut>(attempts: usize, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..attempts {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met after {attempts} attempts");
}

#[must_use]
pub fn product(name: &str, dollars: i64) -> ProductSnapshot {
    ProductSnapshot::new(ProductId::random(), name, Money::whole(dollars))
}
