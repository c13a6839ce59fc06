//! One browser tab's synchronization context.
//!
//! A [`Tab`] is built from an [`Origin`], the set of things every tab of the
//! same site shares: storage, the broadcast hub, the identity provider, the
//! clock and the admin predicate. It owns its own leader election, cart
//! replica and auth session and routes inbound messages between them.
//!
//! Drive a tab either with [`Tab::run`], which loops until shutdown, or by
//! calling [`Tab::heartbeat`] and [`Tab::process_pending`] directly.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior, Sleep};

use crate::auth::{
    AdminPredicate, AuthDeps, AuthError, AuthSession, IdentityProvider, ProviderEvent, SignInThrottle, TokenSigner,
};
use crate::cart::CartStore;
use crate::channel::{BroadcastHub, Inbound, Publisher, Subscription};
use crate::clock::{Clock, to_delta};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::leader::{HeartbeatOutcome, LeaderElection};
use crate::message::{SyncEvent, SyncMessage, TabId};
use crate::storage::{CookieAttributes, CookieJar, SharedStorage, Vault};

// =============================================================================
// Origin
// =============================================================================

/// Collaborators shared by every tab of one origin.
pub struct Origin<P> {
    pub storage: Arc<dyn SharedStorage>,
    pub hub: BroadcastHub,
    pub provider: Arc<P>,
    pub clock: Arc<dyn Clock>,
    pub admin: Arc<dyn AdminPredicate>,
}

impl<P> Clone for Origin<P> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            hub: self.hub.clone(),
            provider: Arc::clone(&self.provider),
            clock: Arc::clone(&self.clock),
            admin: Arc::clone(&self.admin),
        }
    }
}

impl<P> fmt::Debug for Origin<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Origin")
            .field("storage", &self.storage)
            .field("hub", &self.hub)
            .field("clock", &self.clock)
            .field("admin", &self.admin)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tab
// =============================================================================

/// Why a tab discarded its replicas and re-read shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    AuthUpdate,
    StorageConflict,
    /// The tab fell behind the channel and missed messages.
    Lagged,
    Manual,
}

struct Inbox {
    channel: Subscription,
    provider_events: broadcast::Receiver<ProviderEvent>,
    /// When a deferred conflict resync becomes due.
    resync_due: Option<DateTime<Utc>>,
}

/// What the caller should do after a message was handled.
enum Followup {
    Nothing,
    ResyncAfter(Duration),
}

/// A single tab.
pub struct Tab<P> {
    id: TabId,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    election: LeaderElection,
    cart: CartStore,
    auth: AuthSession<P>,
    publisher: Publisher,
    inbox: Mutex<Inbox>,
    resyncs: AtomicU64,
}

impl<P> fmt::Debug for Tab<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tab")
            .field("id", &self.id)
            .field("leader", &self.election.is_leader())
            .field("resyncs", &self.resyncs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: IdentityProvider> Tab<P> {
    /// Open a tab with a fresh id. Nothing is written until [`Tab::boot`].
    #[must_use]
    pub fn open(origin: &Origin<P>, config: Arc<SyncConfig>) -> Self {
        let id = TabId::random();
        let clock = Arc::clone(&origin.clock);

        let hub = if config.broadcast_enabled {
            origin.hub.clone()
        } else {
            BroadcastHub::unsupported()
        };
        let (publisher, channel) = hub.connect(&config.channel_name, id, Arc::clone(&clock));

        let election = LeaderElection::new(
            id,
            Arc::clone(&origin.storage),
            Arc::clone(&clock),
            config.leader_stale_after,
        );
        let vault = Vault::new(Arc::clone(&origin.storage), &config.storage_key, Arc::clone(&clock));
        let cart = CartStore::open(vault.clone(), publisher.clone(), election.leadership());

        let auth = AuthSession::new(AuthDeps {
            provider: Arc::clone(&origin.provider),
            signer: TokenSigner::new(
                &config.token_secret,
                config.token_ttl,
                config.token_max_age,
                Arc::clone(&clock),
            ),
            cookies: CookieJar::new(Arc::clone(&origin.storage), Arc::clone(&clock)),
            cookie_attributes: CookieAttributes::site_wide(config.token_ttl, config.cookie_secure),
            vault,
            publisher: publisher.clone(),
            leadership: election.leadership(),
            admin: Arc::clone(&origin.admin),
            throttle: SignInThrottle::per_minute(config.sign_in_per_minute),
        });

        let inbox = Inbox {
            channel,
            provider_events: origin.provider.subscribe(),
            resync_due: None,
        };

        tracing::debug!(tab = %id, "tab opened");
        Self {
            id,
            config,
            clock,
            election,
            cart,
            auth,
            publisher,
            inbox: Mutex::new(inbox),
            resyncs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TabId {
        self.id
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    #[must_use]
    pub const fn cart(&self) -> &CartStore {
        &self.cart
    }

    #[must_use]
    pub const fn auth(&self) -> &AuthSession<P> {
        &self.auth
    }

    #[must_use]
    pub const fn election(&self) -> &LeaderElection {
        &self.election
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Number of resyncs performed so far.
    #[must_use]
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Run the election, announce leadership if won, then establish auth.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Storage` if the leader lock cannot be read or written.
    #[tracing::instrument(skip(self), fields(tab = %self.id))]
    pub async fn boot(&self) -> Result<()> {
        if self.election.try_acquire()? {
            self.publisher.broadcast(SyncEvent::LeaderElection(self.id));
        }
        self.auth.boot().await;
        tracing::info!(
            leader = self.is_leader(),
            phase = %self.auth.phase(),
            items = self.cart.item_count(),
            "tab booted"
        );
        Ok(())
    }

    /// One heartbeat: renew or contest the lock and check the cart replica
    /// against persisted state.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Storage` if the leader lock cannot be accessed.
    #[tracing::instrument(skip(self), fields(tab = %self.id), level = "debug")]
    pub async fn heartbeat(&self) -> Result<HeartbeatOutcome> {
        let outcome = self.election.heartbeat()?;
        if outcome == HeartbeatOutcome::Promoted {
            self.publisher.broadcast(SyncEvent::LeaderElection(self.id));
            self.auth.leader_bootstrap().await;
        }

        if let Err(e) = self.cart.rehydrate() {
            tracing::warn!(error = %e, "cart rehydration failed");
        }
        Ok(outcome)
    }

    /// Handle everything already queued for this tab without waiting, then
    /// run a deferred resync if it has come due. Returns the number of
    /// messages and provider events handled.
    ///
    /// Does nothing while [`Tab::run`] owns the inbox.
    pub async fn process_pending(&self) -> usize {
        let Ok(mut inbox) = self.inbox.try_lock() else {
            return 0;
        };
        let mut handled = 0;

        while let Some(event) = next_provider_event(&mut inbox.provider_events) {
            self.auth.handle_provider_event(&event);
            handled += 1;
        }

        while let Some(inbound) = inbox.channel.try_recv() {
            handled += 1;
            match self.handle_inbound(inbound).await {
                Followup::Nothing => {}
                Followup::ResyncAfter(delay) => {
                    inbox.resync_due = Some(self.clock.now() + to_delta(delay));
                }
            }
        }

        if inbox.resync_due.is_some_and(|due| self.clock.now() >= due) {
            inbox.resync_due = None;
            self.resync(ResyncReason::StorageConflict).await;
        }
        handled
    }

    /// Drive the tab until `shutdown` flips to `true`, then release
    /// leadership.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut guard = self.inbox.lock().await;
        let inbox = &mut *guard;
        let mut provider_open = true;
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync_timer: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        tracing::error!(tab = %self.id, error = %e, "heartbeat failed");
                    }
                }
                inbound = inbox.channel.recv() => {
                    if let Followup::ResyncAfter(delay) = self.handle_inbound(inbound).await {
                        resync_timer = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                }
                event = inbox.provider_events.recv(), if provider_open => match event {
                    Ok(event) => self.auth.handle_provider_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(tab = %self.id, missed, "provider events lagged");
                        self.auth.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!(tab = %self.id, "provider event stream closed");
                        provider_open = false;
                    }
                },
                () = fire(&mut resync_timer) => {
                    resync_timer = None;
                    self.resync(ResyncReason::StorageConflict).await;
                }
            }
        }
        drop(guard);

        if let Err(e) = self.close() {
            tracing::warn!(tab = %self.id, error = %e, "failed to release leadership on shutdown");
        }
    }

    /// Discard the local replicas and re-derive them from shared state.
    #[tracing::instrument(skip(self), fields(tab = %self.id))]
    pub async fn resync(&self, reason: ResyncReason) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        self.cart.reload();
        self.auth.resync().await;
        tracing::info!(
            phase = %self.auth.phase(),
            items = self.cart.item_count(),
            "resynced from shared state"
        );
    }

    /// Sign out and drop the cart replica, whose encrypted copy is cleared
    /// along with the rest of the vault.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the provider refuses; nothing is cleared then.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.auth.sign_out().await?;
        self.cart.reload();
        Ok(())
    }

    /// Release leadership if held. Called when the tab closes.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Storage` if the lock cannot be removed.
    pub fn close(&self) -> Result<()> {
        self.election.release()?;
        tracing::debug!(tab = %self.id, "tab closed");
        Ok(())
    }

    async fn handle_inbound(&self, inbound: Inbound) -> Followup {
        match inbound {
            Inbound::Message(message) => self.dispatch(message).await,
            Inbound::Lagged(missed) => {
                tracing::warn!(tab = %self.id, missed, "broadcast channel lagged");
                self.resync(ResyncReason::Lagged).await;
                Followup::Nothing
            }
            Inbound::Closed => {
                tracing::warn!(tab = %self.id, "broadcast channel closed, tab continues alone");
                Followup::Nothing
            }
        }
    }

    /// Route one message from another tab. Handlers never broadcast.
    #[tracing::instrument(skip_all, fields(tab = %self.id, from = %message.from_tab, kind = ?message.event.kind()), level = "debug")]
    async fn dispatch(&self, message: SyncMessage) -> Followup {
        match message.event {
            SyncEvent::LeaderElection(leader) => {
                if self.election.observe_announcement(leader) {
                    tracing::info!(%leader, "stepped down for announced leader");
                }
                Followup::Nothing
            }
            SyncEvent::CartUpdate(snapshot) => {
                if let Err(e) = self.cart.apply_remote(*snapshot) {
                    tracing::error!(error = %e, "failed to apply cart update");
                }
                Followup::Nothing
            }
            SyncEvent::AuthUpdate(_) => {
                self.resync(ResyncReason::AuthUpdate).await;
                Followup::Nothing
            }
            SyncEvent::StorageConflict(report) => {
                if self.is_leader() {
                    tracing::debug!(key = %report.key, "leader ignores conflict report");
                    Followup::Nothing
                } else {
                    tracing::warn!(
                        key = %report.key,
                        delay_ms = self.config.conflict_resync_delay.as_millis(),
                        "storage conflict reported, scheduling resync"
                    );
                    Followup::ResyncAfter(self.config.conflict_resync_delay)
                }
            }
        }
    }
}

fn next_provider_event(rx: &mut broadcast::Receiver<ProviderEvent>) -> Option<ProviderEvent> {
    loop {
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "provider events lagged");
            }
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => return None,
        }
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;
    use geekwear_core::{Money, ProductId, ProductSnapshot};

    use super::*;
    use crate::auth::{InMemoryIdentityProvider, PrivilegedAdmins};
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn origin(clock: &ManualClock) -> Origin<InMemoryIdentityProvider> {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        Origin {
            storage: Arc::new(MemoryStorage::new()),
            hub: BroadcastHub::new(),
            provider: Arc::new(InMemoryIdentityProvider::new(Arc::clone(&clock))),
            clock,
            admin: Arc::new(PrivilegedAdmins::role_only()),
        }
    }

    fn config() -> Arc<SyncConfig> {
        Arc::new(SyncConfig::ephemeral())
    }

    #[tokio::test]
    async fn test_first_tab_leads() {
        let clock = ManualClock::starting_now();
        let origin = origin(&clock);
        let config = config();
        let a = Tab::open(&origin, Arc::clone(&config));
        let b = Tab::open(&origin, config);

        a.boot().await.unwrap();
        b.boot().await.unwrap();

        assert!(a.is_leader());
        assert!(!b.is_leader());
        // B sees A's announcement; nothing changes.
        assert_eq!(b.process_pending().await, 1);
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn test_cart_edit_reaches_follower_without_echo() {
        let clock = ManualClock::starting_now();
        let origin = origin(&clock);
        let config = config();
        let a = Tab::open(&origin, Arc::clone(&config));
        let b = Tab::open(&origin, config);
        a.boot().await.unwrap();
        b.boot().await.unwrap();
        b.process_pending().await;

        let product = ProductSnapshot::new(ProductId::random(), "Pixel Hoodie", Money::whole(45));
        a.cart().add_item(product, 2, None).unwrap();

        assert_eq!(b.process_pending().await, 1);
        assert_eq!(b.cart().snapshot(), a.cart().snapshot());
        // B applied silently: A has nothing to receive.
        assert_eq!(a.process_pending().await, 0);
    }

    #[tokio::test]
    async fn test_promotion_announces_and_bootstraps() {
        let clock = ManualClock::starting_now();
        let origin = origin(&clock);
        let config = config();
        let a = Tab::open(&origin, Arc::clone(&config));
        let b = Tab::open(&origin, config);
        a.boot().await.unwrap();
        b.boot().await.unwrap();
        assert_eq!(b.auth().phase(), crate::auth::AuthPhase::Idle);

        clock.advance(TimeDelta::seconds(11));
        assert_eq!(b.heartbeat().await.unwrap(), HeartbeatOutcome::Promoted);
        assert_eq!(b.auth().phase(), crate::auth::AuthPhase::Anonymous);

        // A hears the announcement and steps down before its own heartbeat.
        a.process_pending().await;
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_announcement_without_lock_keeps_leader() {
        let clock = ManualClock::starting_now();
        let origin = origin(&clock);
        let config = config();
        let a = Tab::open(&origin, Arc::clone(&config));
        let b = Tab::open(&origin, Arc::clone(&config));
        a.boot().await.unwrap();
        b.boot().await.unwrap();
        b.process_pending().await;

        let ghost = TabId::random();
        let (publisher, _subscription) =
            origin.hub.connect(&config.channel_name, ghost, Arc::clone(&origin.clock));
        publisher.broadcast(SyncEvent::LeaderElection(ghost));
        a.process_pending().await;
        b.process_pending().await;

        assert!(a.is_leader());
        assert_eq!(a.heartbeat().await.unwrap(), HeartbeatOutcome::Renewed);
        assert_eq!(b.heartbeat().await.unwrap(), HeartbeatOutcome::Following);
        assert_eq!(a.election().current_leader().unwrap().unwrap().tab_id, a.id());
    }

    #[tokio::test]
    async fn test_close_releases_lock() {
        let clock = ManualClock::starting_now();
        let origin = origin(&clock);
        let config = config();
        let a = Tab::open(&origin, Arc::clone(&config));
        let b = Tab::open(&origin, config);
        a.boot().await.unwrap();
        b.boot().await.unwrap();

        a.close().unwrap();
        assert_eq!(b.heartbeat().await.unwrap(), HeartbeatOutcome::Promoted);
    }

    #[tokio::test]
    async fn test_broadcast_disabled_tabs_run_alone() {
        let clock = ManualClock::starting_now();
        let origin = origin(&clock);
        let mut config = SyncConfig::ephemeral();
        config.broadcast_enabled = false;
        let config = Arc::new(config);
        let a = Tab::open(&origin, Arc::clone(&config));
        let b = Tab::open(&origin, config);
        a.boot().await.unwrap();
        b.boot().await.unwrap();

        let product = ProductSnapshot::new(ProductId::random(), "Pixel Hoodie", Money::whole(45));
        a.cart().add_item(product, 1, None).unwrap();

        assert_eq!(b.process_pending().await, 0);
        assert!(b.cart().snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_heartbeats_and_shuts_down() {
        let origin = {
            let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
            Origin {
                storage: Arc::new(MemoryStorage::new()),
                hub: BroadcastHub::new(),
                provider: Arc::new(InMemoryIdentityProvider::new(Arc::clone(&clock))),
                clock,
                admin: Arc::new(PrivilegedAdmins::role_only()),
            }
        };
        let tab = Arc::new(Tab::open(&origin, config()));
        tab.boot().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn({
            let tab = Arc::clone(&tab);
            async move { tab.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(tab.is_leader());

        tx.send(true).unwrap();
        runner.await.unwrap();
        assert!(!tab.is_leader());
        assert!(origin.storage.get(crate::storage::keys::LEADER_LOCK).unwrap().is_none());
    }
}
