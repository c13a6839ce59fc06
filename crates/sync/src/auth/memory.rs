//! In-process identity provider.
//!
//! Used by the simulator and tests. One instance is shared by all tabs of an
//! origin, so a sign-in performed in one tab is visible to every tab's
//! session query and event stream, as with a hosted provider whose session
//! lives in origin storage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::broadcast;

use geekwear_core::{Email, UserId};

use super::provider::{
    IdentityProvider, OAuthProvider, OAuthRedirect, ProviderError, ProviderEvent, ProviderSession, ProviderUser,
};
use crate::clock::{Clock, to_delta};

/// Upstream session lifetime.
const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

const EVENT_CAPACITY: usize = 32;

struct Account {
    user: ProviderUser,
    /// `None` for accounts created through OAuth.
    password_hash: Option<String>,
}

struct Inner {
    accounts: RwLock<HashMap<String, Account>>,
    session: RwLock<Option<ProviderSession>>,
    oauth: HashSet<OAuthProvider>,
    events: broadcast::Sender<ProviderEvent>,
    offline: AtomicBool,
    clock: Arc<dyn Clock>,
}

/// Identity provider backed by process memory. Clones share accounts and the
/// session.
#[derive(Clone)]
pub struct InMemoryIdentityProvider {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIdentityProvider")
            .field("accounts", &self.inner.accounts.read().len())
            .field("signed_in", &self.inner.session.read().is_some())
            .finish_non_exhaustive()
    }
}

impl InMemoryIdentityProvider {
    /// A provider with Google and Discord OAuth enabled.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_oauth(clock, [OAuthProvider::Google, OAuthProvider::Discord])
    }

    #[must_use]
    pub fn with_oauth(clock: Arc<dyn Clock>, oauth: impl IntoIterator<Item = OAuthProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                accounts: RwLock::default(),
                session: RwLock::default(),
                oauth: oauth.into_iter().collect(),
                events,
                offline: AtomicBool::new(false),
                clock,
            }),
        }
    }

    /// Register an account directly, without signing in.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::UserAlreadyExists` if the email is taken.
    pub fn add_account(
        &self,
        email: &Email,
        password: &str,
        display_name: Option<&str>,
        role: Option<&str>,
    ) -> Result<ProviderUser, ProviderError> {
        let user = ProviderUser {
            id: UserId::random(),
            email: email.clone(),
            display_name: display_name.map(str::to_owned),
            role: role.map(str::to_owned),
        };
        self.insert_account(user.clone(), Some(hash_password(password)?))?;
        Ok(user)
    }

    /// Finish an OAuth round trip started with `sign_in_with_oauth`, creating
    /// the account on first use.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::OAuthUnsupported` if the provider is not enabled.
    pub fn complete_oauth_sign_in(
        &self,
        provider: OAuthProvider,
        email: &Email,
        display_name: Option<&str>,
    ) -> Result<ProviderSession, ProviderError> {
        self.ensure_online()?;
        if !self.inner.oauth.contains(&provider) {
            return Err(ProviderError::OAuthUnsupported(provider));
        }

        let existing = self
            .inner
            .accounts
            .read()
            .get(&email.normalized())
            .map(|account| account.user.clone());
        let user = if let Some(user) = existing {
            user
        } else {
            let user = ProviderUser {
                id: UserId::random(),
                email: email.clone(),
                display_name: display_name.map(str::to_owned),
                role: None,
            };
            self.insert_account(user.clone(), None)?;
            user
        };
        Ok(self.start_session(user))
    }

    /// Simulate the provider being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Relaxed);
    }

    /// Rotate the upstream access token, as a background refresh would.
    pub fn refresh_session(&self) -> Option<ProviderSession> {
        let refreshed = {
            let mut session = self.inner.session.write();
            let current = session.as_mut()?;
            current.access_token = access_token();
            current.expires_at = self.inner.clock.now() + to_delta(SESSION_TTL);
            current.clone()
        };
        self.emit(ProviderEvent::TokenRefreshed(refreshed.clone()));
        Some(refreshed)
    }

    fn ensure_online(&self) -> Result<(), ProviderError> {
        if self.inner.offline.load(Ordering::Relaxed) {
            return Err(ProviderError::Unavailable("provider offline".to_string()));
        }
        Ok(())
    }

    fn insert_account(&self, user: ProviderUser, password_hash: Option<String>) -> Result<(), ProviderError> {
        let mut accounts = self.inner.accounts.write();
        let key = user.email.normalized();
        if accounts.contains_key(&key) {
            return Err(ProviderError::UserAlreadyExists);
        }
        accounts.insert(key, Account { user, password_hash });
        Ok(())
    }

    fn start_session(&self, user: ProviderUser) -> ProviderSession {
        let session = ProviderSession {
            user,
            access_token: access_token(),
            expires_at: self.inner.clock.now() + to_delta(SESSION_TTL),
        };
        *self.inner.session.write() = Some(session.clone());
        self.emit(ProviderEvent::SignedIn(session.clone()));
        session
    }

    fn emit(&self, event: ProviderEvent) {
        // No subscribers is fine; nobody is listening yet.
        let _ = self.inner.events.send(event);
    }
}

impl IdentityProvider for InMemoryIdentityProvider {
    async fn get_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        self.ensure_online()?;
        let now = self.inner.clock.now();
        let mut session = self.inner.session.write();
        if session.as_ref().is_some_and(|s| s.expires_at <= now) {
            *session = None;
        }
        Ok(session.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    async fn sign_in_with_password(&self, email: &Email, password: &str) -> Result<ProviderSession, ProviderError> {
        self.ensure_online()?;
        let (user, hash) = {
            let accounts = self.inner.accounts.read();
            let account = accounts
                .get(&email.normalized())
                .ok_or(ProviderError::InvalidCredentials)?;
            let hash = account
                .password_hash
                .clone()
                .ok_or(ProviderError::InvalidCredentials)?;
            (account.user.clone(), hash)
        };
        verify_password(password, &hash)?;
        Ok(self.start_session(user))
    }

    async fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<OAuthRedirect, ProviderError> {
        self.ensure_online()?;
        if !self.inner.oauth.contains(&provider) {
            return Err(ProviderError::OAuthUnsupported(provider));
        }
        Ok(OAuthRedirect {
            provider,
            url: format!("https://auth.geekwear.test/authorize?provider={provider}&state={}", access_token()),
        })
    }

    async fn sign_up(
        &self,
        email: &Email,
        password: &str,
        display_name: Option<String>,
    ) -> Result<ProviderSession, ProviderError> {
        self.ensure_online()?;
        let user = ProviderUser {
            id: UserId::random(),
            email: email.clone(),
            display_name,
            role: None,
        };
        self.insert_account(user.clone(), Some(hash_password(password)?))?;
        Ok(self.start_session(user))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.ensure_online()?;
        let had_session = self.inner.session.write().take().is_some();
        if had_session {
            self.emit(ProviderEvent::SignedOut);
        }
        Ok(())
    }
}

fn access_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Argon2id with a small memory cost; these hashes never leave the process.
fn hasher() -> Result<Argon2<'static>, ProviderError> {
    let params = Params::new(8 * 1024, 1, 1, None).map_err(|e| ProviderError::Unavailable(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

fn hash_password(password: &str) -> Result<String, ProviderError> {
    let salt = SaltString::generate(&mut OsRng);
    hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ProviderError::Unavailable(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<(), ProviderError> {
    let parsed = PasswordHash::new(hash).map_err(|_| ProviderError::InvalidCredentials)?;
    hasher()?
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ProviderError::InvalidCredentials)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::clock::ManualClock;

    fn email(s: &str) -> Email {
        Email::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_password_sign_in_starts_shared_session() {
        let provider = InMemoryIdentityProvider::new(Arc::new(ManualClock::starting_now()));
        let other_tab = provider.clone();
        let mut events = other_tab.subscribe();
        provider
            .add_account(&email("zelda@hyrule.example"), "triforce-of-wisdom", Some("Zelda"), None)
            .unwrap();

        let session = provider
            .sign_in_with_password(&email("Zelda@Hyrule.example"), "triforce-of-wisdom")
            .await
            .unwrap();

        assert_eq!(session.user.display_name.as_deref(), Some("Zelda"));
        assert_eq!(other_tab.get_session().await.unwrap(), Some(session.clone()));
        assert_eq!(events.recv().await.unwrap(), ProviderEvent::SignedIn(session));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let provider = InMemoryIdentityProvider::new(Arc::new(ManualClock::starting_now()));
        provider
            .add_account(&email("zelda@hyrule.example"), "triforce-of-wisdom", None, None)
            .unwrap();

        let err = provider
            .sign_in_with_password(&email("zelda@hyrule.example"), "wrong-password")
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::InvalidCredentials);

        let err = provider
            .sign_in_with_password(&email("ganon@hyrule.example"), "anything")
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_duplicate_sign_up() {
        let provider = InMemoryIdentityProvider::new(Arc::new(ManualClock::starting_now()));
        provider
            .sign_up(&email("mario@kingdom.example"), "its-a-me-mario", None)
            .await
            .unwrap();
        let err = provider
            .sign_up(&email("MARIO@kingdom.example"), "its-a-me-mario", None)
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::UserAlreadyExists);
    }

    #[tokio::test]
    async fn test_session_expires() {
        let clock = ManualClock::starting_now();
        let provider = InMemoryIdentityProvider::new(Arc::new(clock.clone()));
        provider
            .sign_up(&email("mario@kingdom.example"), "its-a-me-mario", None)
            .await
            .unwrap();

        clock.advance(TimeDelta::hours(2));
        assert!(provider.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oauth_flow() {
        let provider = InMemoryIdentityProvider::with_oauth(Arc::new(ManualClock::starting_now()), [OAuthProvider::Discord]);

        let redirect = provider.sign_in_with_oauth(OAuthProvider::Discord).await.unwrap();
        assert!(redirect.url.contains("provider=discord"));
        assert_eq!(
            provider.sign_in_with_oauth(OAuthProvider::Github).await.unwrap_err(),
            ProviderError::OAuthUnsupported(OAuthProvider::Github)
        );

        let first = provider
            .complete_oauth_sign_in(OAuthProvider::Discord, &email("kirby@dreamland.example"), Some("Kirby"))
            .unwrap();
        let second = provider
            .complete_oauth_sign_in(OAuthProvider::Discord, &email("kirby@dreamland.example"), None)
            .unwrap();
        assert_eq!(first.user.id, second.user.id);

        // OAuth-only accounts have no password.
        assert_eq!(
            provider
                .sign_in_with_password(&email("kirby@dreamland.example"), "")
                .await
                .unwrap_err(),
            ProviderError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn test_offline_provider() {
        let provider = InMemoryIdentityProvider::new(Arc::new(ManualClock::starting_now()));
        provider.set_offline(true);
        assert!(matches!(provider.get_session().await, Err(ProviderError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_sign_out_emits_once() {
        let provider = InMemoryIdentityProvider::new(Arc::new(ManualClock::starting_now()));
        let mut events = provider.subscribe();
        provider
            .sign_up(&email("samus@zebes.example"), "varia-suit-1", None)
            .await
            .unwrap();
        provider.sign_out().await.unwrap();
        provider.sign_out().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), ProviderEvent::SignedIn(_)));
        assert_eq!(events.recv().await.unwrap(), ProviderEvent::SignedOut);
        assert!(events.try_recv().is_err());
    }
}
