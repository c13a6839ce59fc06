//! Multi-tab simulation.
//!
//! Opens several tabs of one origin over in-memory storage, a local
//! broadcast hub and the in-memory identity provider, then walks them
//! through a scripted session: cart edits, a follower-side conflict, a
//! sign-in and optionally a leader crash. Time is driven by a manual clock
//! so the run finishes immediately.

use std::sync::Arc;

use chrono::TimeDelta;
use geekwear_core::{Email, Money, ProductId, ProductSnapshot, VariantId, VariantSnapshot};
use geekwear_sync::auth::{InMemoryIdentityProvider, PrivilegedAdmins};
use geekwear_sync::channel::BroadcastHub;
use geekwear_sync::clock::{Clock, ManualClock, to_delta};
use geekwear_sync::storage::MemoryStorage;
use geekwear_sync::{Origin, SyncConfig, SyncError, Tab, TabId};

use super::CommandError;

type SimTab = Tab<InMemoryIdentityProvider>;

const DEMO_EMAIL: &str = "link@hyrule.example";
const DEMO_PASSWORD: &str = "master-sword-1986";

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub tabs: usize,
    pub crash_leader: bool,
    pub ephemeral_secrets: bool,
}

/// Final state of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub leader: Option<TabId>,
    pub cart_total: Money,
    pub authenticated_tabs: usize,
    pub resyncs: u64,
}

/// Run the scripted session.
pub async fn run(options: &SimulateOptions) -> Result<SimulationReport, CommandError> {
    let config = if options.ephemeral_secrets {
        SyncConfig::ephemeral()
    } else {
        SyncConfig::from_env()?
    };
    let config = Arc::new(config);

    let clock = ManualClock::starting_now();
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let provider = Arc::new(InMemoryIdentityProvider::new(Arc::clone(&shared_clock)));
    let origin = Origin {
        storage: Arc::new(MemoryStorage::new()),
        hub: BroadcastHub::new(),
        provider: Arc::clone(&provider),
        clock: shared_clock,
        admin: Arc::new(PrivilegedAdmins::new(&config.privileged_emails)),
    };

    let mut tabs: Vec<SimTab> = (0..options.tabs)
        .map(|_| Tab::open(&origin, Arc::clone(&config)))
        .collect();
    for tab in &tabs {
        tab.boot().await?;
    }
    settle(&tabs).await;
    log_tabs("booted", &tabs);

    // The leader's edits are broadcast and applied by every follower.
    if let Some(leader) = tabs.iter().find(|tab| tab.is_leader()) {
        let hoodie = ProductSnapshot::new(ProductId::random(), "Pixel Hoodie", Money::whole(45));
        let large = VariantSnapshot::new(VariantId::random(), "XL", Money::whole(5));
        leader.cart().add_item(hoodie, 1, Some(large)).map_err(SyncError::from)?;
        leader.cart().apply_coupon(Money::whole(10)).map_err(SyncError::from)?;
    }
    settle(&tabs).await;
    log_tabs("leader edited cart", &tabs);

    // A follower edit only reaches storage; the next leader heartbeat notices
    // the divergence and followers resync after the configured delay.
    if let Some(follower) = tabs.iter().find(|tab| !tab.is_leader()) {
        let sticker = ProductSnapshot::new(ProductId::random(), "Debug Duck Sticker", Money::from_cents(350));
        follower.cart().add_item(sticker, 3, None).map_err(SyncError::from)?;
    }
    heartbeat_all(&tabs).await?;
    settle(&tabs).await;
    clock.advance(to_delta(config.conflict_resync_delay));
    settle(&tabs).await;
    log_tabs("storage conflict resolved", &tabs);

    // Sign in from the last tab; the leader mints the token for everyone.
    let email = Email::parse(DEMO_EMAIL)?;
    provider
        .add_account(&email, DEMO_PASSWORD, Some("Link"), None)
        .map_err(SyncError::from)?;
    if let Some(tab) = tabs.last() {
        tab.auth()
            .sign_in_with_password(DEMO_EMAIL, DEMO_PASSWORD)
            .await
            .map_err(SyncError::from)?;
    }
    settle(&tabs).await;
    log_tabs("signed in", &tabs);

    if options.crash_leader {
        if let Some(index) = tabs.iter().position(SimTab::is_leader) {
            let crashed = tabs.remove(index);
            tracing::warn!(tab = %crashed.id(), "leader crashed without releasing its lock");
            drop(crashed);
        }
        clock.advance(to_delta(config.leader_stale_after) + TimeDelta::milliseconds(1));
        heartbeat_all(&tabs).await?;
        settle(&tabs).await;
        log_tabs("after failover", &tabs);
    }

    let leader = tabs.iter().find(|tab| tab.is_leader()).map(SimTab::id);
    let cart_total = tabs
        .first()
        .map_or(Money::ZERO, |tab| tab.cart().snapshot().total);
    let authenticated_tabs = tabs.iter().filter(|tab| tab.auth().state().is_authenticated()).count();
    let resyncs = tabs.iter().map(SimTab::resync_count).sum();

    for tab in &tabs {
        tab.close()?;
    }

    Ok(SimulationReport {
        leader,
        cart_total,
        authenticated_tabs,
        resyncs,
    })
}

/// Deliver queued messages until every tab is quiet.
async fn settle(tabs: &[SimTab]) {
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

async fn heartbeat_all(tabs: &[SimTab]) -> Result<(), SyncError> {
    for tab in tabs {
        let outcome = tab.heartbeat().await?;
        tracing::debug!(tab = %tab.id(), ?outcome, "heartbeat");
    }
    Ok(())
}

fn log_tabs(stage: &str, tabs: &[SimTab]) {
    for tab in tabs {
        let cart = tab.cart().snapshot();
        tracing::info!(
            stage,
            tab = %tab.id(),
            leader = tab.is_leader(),
            items = cart.item_count(),
            total = %cart.total,
            auth = %tab.auth().phase(),
            "tab state"
        );
    }
}
