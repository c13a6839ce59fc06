//! GeekWear Core - Shared domain types.
//!
//! This crate provides the types shared by every GeekWear component:
//! - `sync` - Cross-tab cart and session coordination
//! - `cli` - Simulator and token tooling
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no storage access, no
//! clocks. Catalog data arrives here as snapshots taken by the caller; the
//! core never re-fetches prices or availability.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, emails, money, catalog snapshots and user profiles

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;

#[doc(hidden)]
pub use uuid;
