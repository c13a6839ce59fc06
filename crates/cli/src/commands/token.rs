//! Session token commands.
//!
//! Both commands sign with `GEEKWEAR_TOKEN_SECRET`, so a token minted here is
//! accepted by any tab configured from the same environment.

use std::sync::Arc;

use geekwear_core::{Email, UserId, UserProfile};
use geekwear_sync::SyncConfig;
use geekwear_sync::auth::TokenSigner;
use geekwear_sync::clock::SystemClock;

use super::CommandError;

fn signer() -> Result<TokenSigner, CommandError> {
    let config = SyncConfig::from_env()?;
    Ok(TokenSigner::new(
        &config.token_secret,
        config.token_ttl,
        config.token_max_age,
        Arc::new(SystemClock),
    ))
}

/// Mint a token for a new user id with the given email.
pub fn sign(email: &str, name: Option<String>, admin: bool) -> Result<String, CommandError> {
    let user = UserProfile {
        id: UserId::random(),
        email: Email::parse(email)?,
        display_name: name,
        is_admin: admin,
    };
    tracing::info!(user_id = %user.id, email = %user.email, admin, "minting token");
    Ok(signer()?.sign(&user)?)
}

/// Validate a token and render its claims as JSON.
pub fn verify(token: &str) -> Result<String, CommandError> {
    let claims = signer()?.decode(token)?;
    Ok(serde_json::to_string_pretty(&claims)?)
}
