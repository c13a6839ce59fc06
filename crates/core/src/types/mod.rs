//! Core types for GeekWear.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod catalog;
pub mod email;
pub mod id;
pub mod money;
pub mod user;

pub use catalog::{ProductSnapshot, VariantSnapshot, unit_price};
pub use email::{Email, EmailError};
pub use id::*;
pub use money::Money;
pub use user::UserProfile;
