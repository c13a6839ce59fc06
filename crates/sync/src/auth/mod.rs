//! Authentication state synchronization.
//!
//! # Submodules
//!
//! - [`session`] - Per-tab auth state machine and provider reconciliation
//! - [`token`] - HS256 session tokens
//! - [`provider`] - Identity provider boundary
//! - [`memory`] - In-process identity provider
//! - [`admin`] - Admin privilege predicate
//! - [`throttle`] - Per-email credential attempt limits

pub mod admin;
pub mod memory;
pub mod provider;
pub mod session;
pub mod throttle;
pub mod token;

pub use admin::{AdminPredicate, PrivilegedAdmins};
pub use memory::InMemoryIdentityProvider;
pub use provider::{
    IdentityProvider, OAuthProvider, OAuthRedirect, ProviderError, ProviderEvent, ProviderSession, ProviderUser,
};
pub use session::{AuthDeps, AuthError, AuthPhase, AuthSession, AuthState, MIN_PASSWORD_LENGTH};
pub use throttle::SignInThrottle;
pub use token::{TokenClaims, TokenError, TokenSigner};
