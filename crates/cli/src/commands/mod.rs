//! Subcommand implementations.

use thiserror::Error;

pub mod simulate;
pub mod token;

/// Errors surfaced by any subcommand.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] geekwear_sync::ConfigError),

    #[error(transparent)]
    Sync(#[from] geekwear_sync::SyncError),

    #[error("Invalid email: {0}")]
    InvalidEmail(#[from] geekwear_core::EmailError),

    #[error("Token rejected: {0}")]
    Token(#[from] geekwear_sync::auth::TokenError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
