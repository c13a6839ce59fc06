//! GeekWear Sync - cross-tab coordination for the storefront.
//!
//! Every open tab keeps its own replica of the cart and the auth session.
//! Tabs of one origin share a key-value store and a broadcast channel; one
//! of them is elected leader through a lock in that store, and the leader's
//! writes are the source of truth the others follow.
//!
//! # Architecture
//!
//! - An [`Origin`](tab::Origin) bundles what tabs share (storage, channel
//!   hub, identity provider, clock, admin predicate).
//! - A [`Tab`](tab::Tab) is opened from an origin and owns a
//!   [`LeaderElection`](leader::LeaderElection), a [`CartStore`](cart::CartStore)
//!   and an [`AuthSession`](auth::AuthSession).
//! - Local edits go through `apply_local`, which broadcasts when leading;
//!   updates from other tabs go through `apply_remote`, which never does.
//!
//! # Modules
//!
//! - [`tab`] - Tab context, message routing and run loop
//! - [`leader`] - Compare-and-swap leader lock and heartbeat
//! - [`channel`] - Named broadcast channels with self-echo suppression
//! - [`message`] - Wire format of inter-tab messages
//! - [`cart`] - Cart arithmetic and replica
//! - [`auth`] - Auth session, tokens and the identity provider boundary
//! - [`storage`] - Shared storage, encrypted vault and cookie jar
//! - [`clock`] - Injected wall clock
//! - [`config`] - Environment configuration
//! - [`error`] - Unified error type

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod auth;
pub mod cart;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod leader;
pub mod message;
pub mod storage;
pub mod tab;

pub use cart::{CartError, CartItem, CartLineId, CartOp, CartState, CartStore};
pub use config::{ConfigError, SyncConfig};
pub use error::{Result, SyncError};
pub use message::{MessageKind, SyncEvent, SyncMessage, TabId};
pub use tab::{Origin, ResyncReason, Tab};
