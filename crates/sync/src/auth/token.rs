//! Signed session tokens.
//!
//! HS256 JWTs carrying the user's identity. Expiry and maximum age are
//! checked against the injected [`Clock`] rather than the system time, so
//! `jsonwebtoken`'s own `exp` validation is disabled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use geekwear_core::{Email, EmailError, UserId, UserProfile};

use crate::clock::{Clock, to_delta};

/// Tokens issued this far in the future are still accepted.
const CLOCK_SKEW_SECS: i64 = 60;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub admin: bool,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    /// Rebuild the profile these claims describe.
    ///
    /// # Errors
    ///
    /// Returns `EmailError` if the `email` claim is not a valid address.
    pub fn profile(&self) -> Result<UserProfile, EmailError> {
        Ok(UserProfile {
            id: self.sub,
            email: Email::parse(&self.email)?,
            display_name: self.name.clone(),
            is_admin: self.admin,
        })
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("token expired")]
    Expired,

    #[error("token older than the maximum session age")]
    TooOld,

    #[error("token issued in the future")]
    IssuedInFuture,

    #[error("token carries an invalid email: {0}")]
    BadEmail(#[from] EmailError),
}

/// Issues and verifies session tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    #[must_use]
    pub fn new(secret: &SecretString, ttl: Duration, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            ttl,
            max_age,
            clock,
        }
    }

    /// Sign a token for `user`, valid for the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Invalid` if encoding fails.
    pub fn sign(&self, user: &UserProfile) -> Result<String, TokenError> {
        let now = self.clock.now();
        let claims = TokenClaims {
            sub: user.id,
            email: user.email.as_str().to_owned(),
            name: user.display_name.clone(),
            admin: user.is_admin,
            iat: now.timestamp(),
            exp: (now + to_delta(self.ttl)).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Decode and fully validate a token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` naming the first check that failed.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        let claims = decode::<TokenClaims>(token, &self.decoding, &validation)?.claims;

        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.iat > now + CLOCK_SKEW_SECS {
            return Err(TokenError::IssuedInFuture);
        }
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(claims.iat) > max_age {
            return Err(TokenError::TooOld);
        }
        Ok(claims)
    }

    /// Verify a token and return the user it identifies. Any failure is
    /// logged and reported as "no token".
    #[must_use]
    pub fn verify(&self, token: &str) -> Option<UserProfile> {
        match self.decode(token).and_then(|claims| Ok(claims.profile()?)) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::debug!(error = %e, "session token rejected");
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::clock::ManualClock;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn user() -> UserProfile {
        UserProfile {
            id: UserId::random(),
            email: Email::parse("link@hyrule.example").unwrap(),
            display_name: Some("Link".to_string()),
            is_admin: false,
        }
    }

    fn signer(clock: &ManualClock, secret: &str, ttl: Duration, max_age: Duration) -> TokenSigner {
        TokenSigner::new(
            &SecretString::from(secret.to_string()),
            ttl,
            max_age,
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_sign_then_verify_returns_same_user() {
        let clock = ManualClock::starting_now();
        let signer = signer(&clock, "token-secret", DAY, DAY);
        let user = user();

        let token = signer.sign(&user).unwrap();
        assert_eq!(signer.verify(&token), Some(user));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let clock = ManualClock::starting_now();
        let signer = signer(&clock, "token-secret", DAY, DAY);
        let token = signer.sign(&user()).unwrap();

        let (head, sig) = token.rsplit_once('.').unwrap();
        let flipped = if sig.starts_with('A') { 'B' } else { 'A' };
        let tampered = format!("{head}.{flipped}{}", &sig[1..]);

        assert!(signer.verify(&tampered).is_none());
        assert!(matches!(signer.decode(&tampered), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let clock = ManualClock::starting_now();
        let token = signer(&clock, "first", DAY, DAY).sign(&user()).unwrap();
        assert!(signer(&clock, "second", DAY, DAY).verify(&token).is_none());
    }

    #[test]
    fn test_expired_token() {
        let clock = ManualClock::starting_now();
        let signer = signer(&clock, "token-secret", DAY, DAY);
        let token = signer.sign(&user()).unwrap();

        clock.advance(TimeDelta::hours(24));
        assert!(matches!(signer.decode(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn test_max_age_applies_before_exp() {
        let clock = ManualClock::starting_now();
        // Long-lived token, short session cap.
        let signer = signer(&clock, "token-secret", DAY * 7, DAY);
        let token = signer.sign(&user()).unwrap();

        clock.advance(TimeDelta::hours(23));
        assert!(signer.verify(&token).is_some());
        clock.advance(TimeDelta::hours(2));
        assert!(matches!(signer.decode(&token), Err(TokenError::TooOld)));
    }

    #[test]
    fn test_future_token_rejected() {
        let clock = ManualClock::starting_now();
        let signer = signer(&clock, "token-secret", DAY, DAY);
        let token = signer.sign(&user()).unwrap();

        clock.advance(TimeDelta::minutes(-5));
        assert!(matches!(signer.decode(&token), Err(TokenError::IssuedInFuture)));
    }

    #[test]
    fn test_claims_shape() {
        let clock = ManualClock::starting_now();
        let signer = signer(&clock, "token-secret", DAY, DAY);
        let mut admin = user();
        admin.is_admin = true;

        let claims = signer.decode(&signer.sign(&admin).unwrap()).unwrap();
        assert_eq!(claims.sub, admin.id);
        assert_eq!(claims.email, "link@hyrule.example");
        assert_eq!(claims.name.as_deref(), Some("Link"));
        assert!(claims.admin);
        assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);
    }
}
