//! External identity provider boundary.
//!
//! The provider owns credentials and the upstream session. Tabs only ever
//! see it through [`IdentityProvider`]: a session query, an auth state
//! change stream, and pass-through sign-in/sign-up/sign-out calls.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use geekwear_core::{Email, UserId};

/// The provider's view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: UserId,
    pub email: Email,
    pub display_name: Option<String>,
    /// Role recorded by the provider, e.g. `"admin"`.
    pub role: Option<String>,
}

/// An upstream session.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderSession {
    pub user: ProviderUser,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSession")
            .field("user", &self.user)
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Auth state change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SignedIn(ProviderSession),
    SignedOut,
    TokenRefreshed(ProviderSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Discord,
    Github,
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Google => "google",
            Self::Discord => "discord",
            Self::Github => "github",
        })
    }
}

/// Where to send the browser to continue an OAuth sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthRedirect {
    pub provider: OAuthProvider,
    pub url: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user already exists")]
    UserAlreadyExists,

    #[error("oauth provider not enabled: {0}")]
    OAuthUnsupported(OAuthProvider),

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// An identity provider shared by every tab of an origin.
pub trait IdentityProvider: Send + Sync + 'static {
    /// The current upstream session, if any.
    fn get_session(&self) -> impl Future<Output = Result<Option<ProviderSession>, ProviderError>> + Send;

    /// Subscribe to auth state changes.
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    fn sign_in_with_password(
        &self,
        email: &Email,
        password: &str,
    ) -> impl Future<Output = Result<ProviderSession, ProviderError>> + Send;

    fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
    ) -> impl Future<Output = Result<OAuthRedirect, ProviderError>> + Send;

    fn sign_up(
        &self,
        email: &Email,
        password: &str,
        display_name: Option<String>,
    ) -> impl Future<Output = Result<ProviderSession, ProviderError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), ProviderError>> + Send;
}
