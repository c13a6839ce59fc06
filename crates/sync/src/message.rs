//! Messages exchanged between tabs.
//!
//! On the wire a message is a JSON object
//! `{"type": "CART_UPDATE", "data": {...}, "fromTab": "...", "timestamp": "..."}`.
//! The timestamp is advisory only; nothing orders messages by it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use geekwear_core::UserProfile;

use crate::cart::CartState;

geekwear_core::define_id!(TabId);

/// Discriminant carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    LeaderElection,
    CartUpdate,
    AuthUpdate,
    StorageConflict,
}

/// `AUTH_UPDATE` payload. Both fields are `None` after a sign-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthBroadcast {
    pub user: Option<UserProfile>,
    pub token: Option<String>,
}

/// `STORAGE_CONFLICT` payload describing a divergent persisted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub key: String,
    pub local_items: usize,
    pub persisted_items: usize,
}

/// A typed inter-tab event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The named tab now holds the leader lock.
    LeaderElection(TabId),
    /// Full cart snapshot from the leader.
    CartUpdate(Box<CartState>),
    AuthUpdate(AuthBroadcast),
    StorageConflict(ConflictReport),
}

impl SyncEvent {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::LeaderElection(_) => MessageKind::LeaderElection,
            Self::CartUpdate(_) => MessageKind::CartUpdate,
            Self::AuthUpdate(_) => MessageKind::AuthUpdate,
            Self::StorageConflict(_) => MessageKind::StorageConflict,
        }
    }
}

/// An event stamped with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub event: SyncEvent,
    pub from_tab: TabId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed sync message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    data: serde_json::Value,
    from_tab: TabId,
    timestamp: DateTime<Utc>,
}

impl SyncMessage {
    /// Encode for the channel.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Malformed` if the payload cannot be serialized.
    pub fn to_wire(&self) -> Result<String, MessageError> {
        let data = match &self.event {
            SyncEvent::LeaderElection(leader) => serde_json::to_value(leader)?,
            SyncEvent::CartUpdate(cart) => serde_json::to_value(cart)?,
            SyncEvent::AuthUpdate(auth) => serde_json::to_value(auth)?,
            SyncEvent::StorageConflict(report) => serde_json::to_value(report)?,
        };
        let wire = WireMessage {
            kind: self.event.kind(),
            data,
            from_tab: self.from_tab,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decode a frame received from the channel.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Malformed` if the frame is not a valid message
    /// or its `data` does not match its `type`.
    pub fn from_wire(frame: &str) -> Result<Self, MessageError> {
        let wire: WireMessage = serde_json::from_str(frame)?;
        let event = match wire.kind {
            MessageKind::LeaderElection => SyncEvent::LeaderElection(serde_json::from_value(wire.data)?),
            MessageKind::CartUpdate => SyncEvent::CartUpdate(serde_json::from_value(wire.data)?),
            MessageKind::AuthUpdate => SyncEvent::AuthUpdate(serde_json::from_value(wire.data)?),
            MessageKind::StorageConflict => {
                SyncEvent::StorageConflict(serde_json::from_value(wire.data)?)
            }
        };
        Ok(Self {
            event,
            from_tab: wire.from_tab,
            timestamp: wire.timestamp,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let leader = TabId::random();
        let message = SyncMessage {
            event: SyncEvent::LeaderElection(leader),
            from_tab: leader,
            timestamp: Utc::now(),
        };

        let value: serde_json::Value = serde_json::from_str(&message.to_wire().unwrap()).unwrap();
        assert_eq!(value["type"], "LEADER_ELECTION");
        assert_eq!(value["data"], leader.to_string());
        assert_eq!(value["fromTab"], leader.to_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_sign_out_broadcast_has_null_fields() {
        let message = SyncMessage {
            event: SyncEvent::AuthUpdate(AuthBroadcast::default()),
            from_tab: TabId::random(),
            timestamp: Utc::now(),
        };
        let value: serde_json::Value = serde_json::from_str(&message.to_wire().unwrap()).unwrap();
        assert!(value["data"]["user"].is_null());
        assert!(value["data"]["token"].is_null());

        let back = SyncMessage::from_wire(&message.to_wire().unwrap()).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_mismatched_payload_is_rejected() {
        let frame = format!(
            r#"{{"type":"STORAGE_CONFLICT","data":"oops","fromTab":"{}","timestamp":"2026-01-01T00:00:00Z"}}"#,
            TabId::random()
        );
        assert!(SyncMessage::from_wire(&frame).is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let frame = format!(
            r#"{{"type":"PING","data":null,"fromTab":"{}","timestamp":"2026-01-01T00:00:00Z"}}"#,
            TabId::random()
        );
        assert!(SyncMessage::from_wire(&frame).is_err());
    }
}
