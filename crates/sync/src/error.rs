//! Unified error type for the sync layer.
//!
//! Coordination failures (lock races, conflicts, bad frames) are recovered
//! inside the tab and only logged. What reaches callers is either a storage
//! failure or an error from an external collaborator.

use thiserror::Error;

use crate::auth::{AuthError, ProviderError, TokenError};
use crate::cart::CartError;
use crate::config::ConfigError;
use crate::message::MessageError;
use crate::storage::{CookieError, StorageError, VaultError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Cookie error: {0}")]
    Cookie(#[from] CookieError),

    #[error("Cart error: {0}")]
    Cart(#[from] CartError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),
}

impl SyncError {
    /// Whether the error came from outside the tab (the identity provider or
    /// user input) rather than from shared storage or local state.
    #[must_use]
    pub const fn is_external(&self) -> bool {
        matches!(
            self,
            Self::Provider(_)
                | Self::Auth(
                    AuthError::Provider(_)
                        | AuthError::InvalidEmail(_)
                        | AuthError::WeakPassword(_)
                        | AuthError::Throttled { .. }
                )
                | Self::Cart(CartError::ZeroQuantity | CartError::NegativeCoupon(_))
        )
    }
}

/// Result type alias for `SyncError`.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
