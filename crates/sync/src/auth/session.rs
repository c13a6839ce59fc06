//! Per-tab authentication state and its reconciliation with the provider.
//!
//! Only the leader talks to the provider on boot and reacts to provider
//! events; it mints the session token, stores it in the shared cookie jar and
//! broadcasts `AUTH_UPDATE`. Followers never mint: they restore from the
//! shared token and resync whenever an `AUTH_UPDATE` arrives.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use geekwear_core::{Email, EmailError, UserProfile};

use super::admin::AdminPredicate;
use super::provider::{IdentityProvider, OAuthProvider, OAuthRedirect, ProviderError, ProviderEvent, ProviderSession, ProviderUser};
use super::throttle::SignInThrottle;
use super::token::{TokenError, TokenSigner};
use crate::channel::Publisher;
use crate::leader::Leadership;
use crate::message::{AuthBroadcast, SyncEvent};
use crate::storage::{CookieAttributes, CookieError, CookieJar, Vault, VaultError, keys};

/// Minimum password length accepted at sign-up.
pub const MIN_PASSWORD_LENGTH: usize = 8;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Initializing,
    /// Follower waiting for the leader to establish the session.
    Idle,
    CheckingToken,
    CheckingProviderSession,
    Authenticated,
    Anonymous,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "INITIALIZING",
            Self::Idle => "IDLE",
            Self::CheckingToken => "CHECKING_TOKEN",
            Self::CheckingProviderSession => "CHECKING_PROVIDER_SESSION",
            Self::Authenticated => "AUTHENTICATED",
            Self::Anonymous => "ANONYMOUS",
        })
    }
}

/// A tab's auth replica. A token is only ever present together with a user.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthState {
    phase: AuthPhase,
    session: Option<(UserProfile, String)>,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("phase", &self.phase)
            .field("user", &self.user())
            .field("token", &self.session.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl AuthState {
    const fn unauthenticated(phase: AuthPhase) -> Self {
        Self { phase, session: None }
    }

    #[must_use]
    pub const fn initializing() -> Self {
        Self::unauthenticated(AuthPhase::Initializing)
    }

    #[must_use]
    pub const fn anonymous() -> Self {
        Self::unauthenticated(AuthPhase::Anonymous)
    }

    #[must_use]
    pub const fn authenticated(user: UserProfile, token: String) -> Self {
        Self {
            phase: AuthPhase::Authenticated,
            session: Some((user, token)),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> AuthPhase {
        self.phase
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserProfile> {
        self.session.as_ref().map(|(user, _)| user)
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.session.as_ref().map(|(_, token)| token.as_str())
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.user().is_some_and(|user| user.is_admin)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email: {0}")]
    InvalidEmail(#[from] EmailError),

    #[error("password validation failed: {0}")]
    WeakPassword(String),

    #[error("too many attempts, retry in {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("identity provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("cookie error: {0}")]
    Cookie(#[from] CookieError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
}

// =============================================================================
// Session
// =============================================================================

/// Collaborators an [`AuthSession`] is built from.
pub struct AuthDeps<P> {
    pub provider: Arc<P>,
    pub signer: TokenSigner,
    pub cookies: CookieJar,
    pub cookie_attributes: CookieAttributes,
    pub vault: Vault,
    pub publisher: Publisher,
    pub leadership: Leadership,
    pub admin: Arc<dyn AdminPredicate>,
    pub throttle: SignInThrottle,
}

/// One tab's auth session.
pub struct AuthSession<P> {
    deps: AuthDeps<P>,
    state: RwLock<AuthState>,
}

impl<P> fmt::Debug for AuthSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl<P: IdentityProvider> AuthSession<P> {
    #[must_use]
    pub fn new(deps: AuthDeps<P>) -> Self {
        Self {
            deps,
            state: RwLock::new(AuthState::initializing()),
        }
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state.read().clone()
    }

    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        self.state.read().phase()
    }

    #[must_use]
    pub fn user(&self) -> Option<UserProfile> {
        self.state.read().user().cloned()
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.state.read().token().map(str::to_owned)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.state.read().is_admin()
    }

    #[must_use]
    pub const fn provider(&self) -> &Arc<P> {
        &self.deps.provider
    }

    /// Establish this tab's initial auth state.
    #[tracing::instrument(skip(self))]
    pub async fn boot(&self) {
        if self.deps.leadership.is_leader() {
            self.leader_bootstrap().await;
        } else {
            self.set_phase(AuthPhase::Idle);
            if let Some((user, token)) = self.restore_from_token() {
                *self.state.write() = AuthState::authenticated(user, token);
            }
        }
    }

    /// Token first, then the provider session; anonymous if neither yields a
    /// user.
    pub async fn leader_bootstrap(&self) {
        self.set_phase(AuthPhase::CheckingToken);
        if let Some((user, token)) = self.restore_from_token() {
            tracing::debug!(user = %user.id, "session restored from token");
            *self.state.write() = AuthState::authenticated(user, token);
            return;
        }

        self.set_phase(AuthPhase::CheckingProviderSession);
        match self.deps.provider.get_session().await {
            Ok(Some(session)) => {
                if let Err(e) = self.establish(&session.user) {
                    tracing::error!(error = %e, "failed to establish session from provider");
                    *self.state.write() = AuthState::anonymous();
                }
            }
            Ok(None) => *self.state.write() = AuthState::anonymous(),
            Err(e) => {
                tracing::warn!(error = %e, "provider session check failed, continuing anonymous");
                *self.state.write() = AuthState::anonymous();
            }
        }
    }

    /// Re-derive state from shared truth after another tab changed it.
    pub async fn resync(&self) {
        if self.deps.leadership.is_leader() {
            self.leader_bootstrap().await;
            return;
        }
        let next = match self.restore_from_token() {
            Some((user, token)) => AuthState::authenticated(user, token),
            None => AuthState::anonymous(),
        };
        *self.state.write() = next;
    }

    /// Pass-through password sign-in. The resulting session is picked up by
    /// the leader through the provider's `SIGNED_IN` event.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Throttled` after too many attempts for this email
    /// and `AuthError::Provider` if the provider rejects the credentials.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<ProviderSession, AuthError> {
        let email = Email::parse(email)?;
        self.throttle(&email)?;
        Ok(self.deps.provider.sign_in_with_password(&email, password).await?)
    }

    /// # Errors
    ///
    /// Returns `AuthError::Provider` if the provider is not enabled.
    pub async fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<OAuthRedirect, AuthError> {
        Ok(self.deps.provider.sign_in_with_oauth(provider).await?)
    }

    /// # Errors
    ///
    /// Returns `AuthError::InvalidEmail`, `AuthError::WeakPassword`,
    /// `AuthError::Throttled` or the provider's error.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<String>,
    ) -> Result<ProviderSession, AuthError> {
        let email = Email::parse(email)?;
        validate_password(password)?;
        self.throttle(&email)?;
        Ok(self.deps.provider.sign_up(&email, password, display_name).await?)
    }

    /// Sign out everywhere: provider, token cookie, encrypted local data.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Provider` if the provider call fails, in which case
    /// local state is left untouched.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.deps.provider.sign_out().await?;
        self.deps.cookies.remove(keys::AUTH_TOKEN)?;
        let cleared = self.deps.vault.clear()?;
        tracing::info!(cleared, "signed out, local data cleared");
        *self.state.write() = AuthState::anonymous();
        self.deps
            .publisher
            .broadcast(SyncEvent::AuthUpdate(AuthBroadcast::default()));
        Ok(())
    }

    /// React to a provider auth state change. Followers ignore these.
    pub fn handle_provider_event(&self, event: &ProviderEvent) {
        if !self.deps.leadership.is_leader() {
            tracing::trace!("follower ignoring provider event");
            return;
        }
        match event {
            ProviderEvent::SignedIn(session) => {
                if let Err(e) = self.establish(&session.user) {
                    tracing::error!(error = %e, "failed to establish session after sign-in");
                }
            }
            ProviderEvent::SignedOut => {
                if let Err(e) = self.deps.cookies.remove(keys::AUTH_TOKEN) {
                    tracing::error!(error = %e, "failed to clear session token");
                }
                *self.state.write() = AuthState::anonymous();
                self.deps
                    .publisher
                    .broadcast(SyncEvent::AuthUpdate(AuthBroadcast::default()));
            }
            ProviderEvent::TokenRefreshed(_) => {
                tracing::debug!("provider refreshed its token");
            }
        }
    }

    /// Mint a token for `user`, store it and tell the other tabs.
    fn establish(&self, user: &ProviderUser) -> Result<UserProfile, AuthError> {
        let profile = UserProfile {
            id: user.id,
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            is_admin: self.deps.admin.is_admin(user),
        };
        let token = self.deps.signer.sign(&profile)?;
        self.deps
            .cookies
            .set(keys::AUTH_TOKEN, &token, self.deps.cookie_attributes.clone())?;

        *self.state.write() = AuthState::authenticated(profile.clone(), token.clone());
        tracing::info!(user = %profile.id, admin = profile.is_admin, "session established");

        self.deps.publisher.broadcast(SyncEvent::AuthUpdate(AuthBroadcast {
            user: Some(profile.clone()),
            token: Some(token),
        }));
        Ok(profile)
    }

    /// Verify the shared token without contacting the provider.
    fn restore_from_token(&self) -> Option<(UserProfile, String)> {
        let token = match self.deps.cookies.get(keys::AUTH_TOKEN) {
            Ok(token) => token?,
            Err(e) => {
                tracing::warn!(error = %e, "session token cookie unreadable");
                return None;
            }
        };
        let user = self.deps.signer.verify(&token)?;
        Some((user, token))
    }

    fn throttle(&self, email: &Email) -> Result<(), AuthError> {
        self.deps
            .throttle
            .check(email)
            .map_err(|wait| AuthError::Throttled {
                retry_after_secs: wait.as_secs().max(1),
            })
    }

    fn set_phase(&self, phase: AuthPhase) {
        self.state.write().phase = phase;
    }
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}
