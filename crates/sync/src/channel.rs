//! Same-origin broadcast channel.
//!
//! A [`BroadcastHub`] plays the role of the browser's `BroadcastChannel`
//! registry: every tab that connects to the same channel name receives every
//! frame published on it, including its own. [`Subscription`] drops those
//! self-sent echoes so a tab never re-applies a mutation it already made.
//!
//! A hub built with [`BroadcastHub::unsupported`] models a runtime without
//! the primitive: publishing is a no-op and subscriptions never yield.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::clock::Clock;
use crate::message::{SyncEvent, SyncMessage, TabId};

/// Frames buffered per channel before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Registry of named channels for one origin.
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    channels: Option<Arc<RwLock<HashMap<String, broadcast::Sender<Arc<str>>>>>>,
}

impl BroadcastHub {
    /// A hub backed by in-process channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Some(Arc::default()),
        }
    }

    /// A hub for a runtime without broadcast support.
    #[must_use]
    pub const fn unsupported() -> Self {
        Self { channels: None }
    }

    #[must_use]
    pub const fn is_supported(&self) -> bool {
        self.channels.is_some()
    }

    /// Join `name` as `tab_id`. On an unsupported hub both halves are inert.
    #[must_use]
    pub fn connect(&self, name: &str, tab_id: TabId, clock: Arc<dyn Clock>) -> (Publisher, Subscription) {
        let Some(channels) = &self.channels else {
            tracing::debug!(channel = name, "broadcast unsupported, tab will not sync");
            return (
                Publisher {
                    tab_id,
                    sender: None,
                    clock,
                },
                Subscription { tab_id, rx: None },
            );
        };

        let sender = channels
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let rx = sender.subscribe();

        (
            Publisher {
                tab_id,
                sender: Some(sender),
                clock,
            },
            Subscription {
                tab_id,
                rx: Some(rx),
            },
        )
    }
}

/// Sending half of a tab's channel connection.
#[derive(Debug, Clone)]
pub struct Publisher {
    tab_id: TabId,
    sender: Option<broadcast::Sender<Arc<str>>>,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    /// Stamp and send an event to every other tab. Best effort: returns
    /// whether the frame was handed to the channel.
    pub fn broadcast(&self, event: SyncEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        let kind = event.kind();
        let message = SyncMessage {
            event,
            from_tab: self.tab_id,
            timestamp: self.clock.now(),
        };
        let frame = match message.to_wire() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, ?kind, "failed to encode sync message");
                return false;
            }
        };

        // An error only means nobody is listening right now.
        let delivered = sender.send(Arc::from(frame)).is_ok();
        tracing::debug!(tab = %self.tab_id, ?kind, delivered, "broadcast");
        delivered
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.sender.is_some()
    }
}

/// What a subscription produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(SyncMessage),
    /// This tab fell behind and `n` frames were lost.
    Lagged(u64),
    Closed,
}

/// Receiving half of a tab's channel connection.
#[derive(Debug)]
pub struct Subscription {
    tab_id: TabId,
    rx: Option<broadcast::Receiver<Arc<str>>>,
}

impl Subscription {
    /// Wait for the next message from another tab. Never resolves on an
    /// unsupported hub.
    pub async fn recv(&mut self) -> Inbound {
        let tab_id = self.tab_id;
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            let frame = match rx.recv().await {
                Ok(frame) => frame,
                Err(RecvError::Lagged(n)) => return Inbound::Lagged(n),
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return Inbound::Closed;
                }
            };
            if let Some(message) = accept(tab_id, &frame) {
                return Inbound::Message(message);
            }
        }
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        let tab_id = self.tab_id;
        let rx = self.rx.as_mut()?;
        loop {
            let frame = match rx.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Inbound::Lagged(n)),
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return Some(Inbound::Closed);
                }
            };
            if let Some(message) = accept(tab_id, &frame) {
                return Some(Inbound::Message(message));
            }
        }
    }

}

/// Decode a frame, dropping our own echoes and anything malformed.
fn accept(tab_id: TabId, frame: &str) -> Option<SyncMessage> {
    match SyncMessage::from_wire(frame) {
        Ok(message) if message.from_tab == tab_id => None,
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(tab = %tab_id, error = %e, "dropping undecodable frame");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::{ConflictReport, MessageKind};

    fn connect(hub: &BroadcastHub) -> (TabId, Publisher, Subscription) {
        let id = TabId::random();
        let (publisher, subscription) = hub.connect("geekwear-tab-sync", id, Arc::new(SystemClock));
        (id, publisher, subscription)
    }

    #[test]
    fn test_sender_does_not_receive_its_own_broadcast() {
        let hub = BroadcastHub::new();
        let (a_id, a_pub, mut a_sub) = connect(&hub);
        let (_, _, mut b_sub) = connect(&hub);

        assert!(a_pub.broadcast(SyncEvent::LeaderElection(a_id)));

        assert!(a_sub.try_recv().is_none());
        match b_sub.try_recv() {
            Some(Inbound::Message(message)) => {
                assert_eq!(message.from_tab, a_id);
                assert_eq!(message.event.kind(), MessageKind::LeaderElection);
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert!(b_sub.try_recv().is_none());
    }

    #[test]
    fn test_channels_are_isolated_by_name() {
        let hub = BroadcastHub::new();
        let (a_id, a_pub, _a_sub) = connect(&hub);
        let (_, mut other) = hub.connect("another-app", TabId::random(), Arc::new(SystemClock));

        a_pub.broadcast(SyncEvent::LeaderElection(a_id));
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_unsupported_hub_is_inert() {
        let hub = BroadcastHub::unsupported();
        assert!(!hub.is_supported());
        let (id, publisher, mut subscription) = connect(&hub);
        assert!(!publisher.is_connected());
        assert!(!publisher.broadcast(SyncEvent::LeaderElection(id)));
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_garbage_frames_are_skipped() {
        let hub = BroadcastHub::new();
        let (_, a_pub, _a_sub) = connect(&hub);
        let (_, _, mut b_sub) = connect(&hub);

        if let Some(sender) = &a_pub.sender {
            sender.send(Arc::from("{not json")).unwrap();
        }
        a_pub.broadcast(SyncEvent::StorageConflict(ConflictReport {
            key: "cart-storage".to_string(),
            local_items: 1,
            persisted_items: 2,
        }));

        match b_sub.try_recv() {
            Some(Inbound::Message(message)) => {
                assert_eq!(message.event.kind(), MessageKind::StorageConflict);
            }
            other => panic!("expected conflict report, got {other:?}"),
        }
    }

    #[test]
    fn test_lagging_receiver_is_reported() {
        let hub = BroadcastHub::new();
        let (a_id, a_pub, _a_sub) = connect(&hub);
        let (_, _, mut b_sub) = connect(&hub);

        for _ in 0..(CHANNEL_CAPACITY + 3) {
            a_pub.broadcast(SyncEvent::LeaderElection(a_id));
        }
        assert_eq!(b_sub.try_recv(), Some(Inbound::Lagged(3)));
    }

    #[tokio::test]
    async fn test_recv_skips_echoes_and_garbage() {
        let hub = BroadcastHub::new();
        let (a_id, a_pub, mut a_sub) = connect(&hub);
        let (b_id, b_pub, _b_sub) = connect(&hub);

        a_pub.broadcast(SyncEvent::LeaderElection(a_id));
        if let Some(sender) = &b_pub.sender {
            sender.send(Arc::from("[]")).unwrap();
        }
        b_pub.broadcast(SyncEvent::LeaderElection(b_id));

        match a_sub.recv().await {
            Inbound::Message(message) => assert_eq!(message.from_tab, b_id),
            other => panic!("expected message from the other tab, got {other:?}"),
        }
        assert!(a_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_waits_for_other_tab() {
        let hub = BroadcastHub::new();
        let (a_id, a_pub, _a_sub) = connect(&hub);
        let (_, _, mut b_sub) = connect(&hub);

        let waiter = tokio::spawn(async move { b_sub.recv().await });
        tokio::task::yield_now().await;
        a_pub.broadcast(SyncEvent::LeaderElection(a_id));

        match waiter.await.unwrap() {
            Inbound::Message(message) => assert_eq!(message.from_tab, a_id),
            other => panic!("expected message, got {other:?}"),
        }
    }
}
