//! Sync configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `GEEKWEAR_TOKEN_SECRET` - Session token signing secret (min 32 chars, high entropy)
//! - `GEEKWEAR_STORAGE_KEY` - Vault encryption secret (min 32 chars, high entropy)
//!
//! ## Optional
//! - `GEEKWEAR_CHANNEL_NAME` - Broadcast channel name (default: geekwear-tab-sync)
//! - `GEEKWEAR_HEARTBEAT_MS` - Leader heartbeat period (default: 5000)
//! - `GEEKWEAR_LEADER_STALE_MS` - Lock staleness threshold, must exceed the heartbeat (default: 10000)
//! - `GEEKWEAR_CONFLICT_RESYNC_MS` - Delay before a follower resyncs on conflict (default: 1000)
//! - `GEEKWEAR_BROADCAST_ENABLED` - Set to false to run tabs independently (default: true)
//! - `GEEKWEAR_TOKEN_TTL_HOURS` - Session token lifetime (default: 24)
//! - `GEEKWEAR_TOKEN_MAX_AGE_HOURS` - Maximum token age regardless of expiry (default: 24)
//! - `GEEKWEAR_COOKIE_SECURE` - Secure attribute on the token cookie (default: true)
//! - `GEEKWEAR_PRIVILEGED_EMAILS` - Comma-separated emails granted admin
//! - `GEEKWEAR_SIGN_IN_PER_MINUTE` - Credential attempts per email per minute (default: 10)

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const MIN_SECRET_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

pub const DEFAULT_CHANNEL_NAME: &str = "geekwear-tab-sync";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Tab synchronization settings shared by every tab of an origin.
///
/// Implements `Debug` manually to redact secret fields.
#[derive(Clone)]
pub struct SyncConfig {
    pub token_secret: SecretString,
    pub storage_key: SecretString,
    pub channel_name: String,
    pub heartbeat_interval: Duration,
    /// A lock older than this may be taken over.
    pub leader_stale_after: Duration,
    pub conflict_resync_delay: Duration,
    pub broadcast_enabled: bool,
    pub token_ttl: Duration,
    pub token_max_age: Duration,
    pub cookie_secure: bool,
    pub privileged_emails: Vec<String>,
    pub sign_in_per_minute: NonZeroU32,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("token_secret", &"[REDACTED]")
            .field("storage_key", &"[REDACTED]")
            .field("channel_name", &self.channel_name)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("leader_stale_after", &self.leader_stale_after)
            .field("conflict_resync_delay", &self.conflict_resync_delay)
            .field("broadcast_enabled", &self.broadcast_enabled)
            .field("token_ttl", &self.token_ttl)
            .field("token_max_age", &self.token_max_age)
            .field("cookie_secure", &self.cookie_secure)
            .field("privileged_emails", &self.privileged_emails)
            .field("sign_in_per_minute", &self.sign_in_per_minute)
            .finish()
    }
}

impl SyncConfig {
    /// Defaults for everything except the two secrets, which are taken as
    /// given without strength validation.
    #[must_use]
    pub fn new(token_secret: SecretString, storage_key: SecretString) -> Self {
        Self {
            token_secret,
            storage_key,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            heartbeat_interval: Duration::from_millis(5_000),
            leader_stale_after: Duration::from_millis(10_000),
            conflict_resync_delay: Duration::from_millis(1_000),
            broadcast_enabled: true,
            token_ttl: hours(24),
            token_max_age: hours(24),
            cookie_secure: true,
            privileged_emails: Vec::new(),
            sign_in_per_minute: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Defaults with freshly generated random secrets. Tokens and vault
    /// items do not survive the process.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::new(random_secret(), random_secret())
    }

    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`SyncConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let token_secret = env.validated_secret("GEEKWEAR_TOKEN_SECRET")?;
        let storage_key = env.validated_secret("GEEKWEAR_STORAGE_KEY")?;
        let mut config = Self::new(token_secret, storage_key);

        if let Some(name) = env.optional("GEEKWEAR_CHANNEL_NAME") {
            config.channel_name = name;
        }
        config.heartbeat_interval = Duration::from_millis(env.parsed_or("GEEKWEAR_HEARTBEAT_MS", 5_000)?);
        config.leader_stale_after = Duration::from_millis(env.parsed_or("GEEKWEAR_LEADER_STALE_MS", 10_000)?);
        config.conflict_resync_delay = Duration::from_millis(env.parsed_or("GEEKWEAR_CONFLICT_RESYNC_MS", 1_000)?);
        config.broadcast_enabled = env.parsed_or("GEEKWEAR_BROADCAST_ENABLED", true)?;
        config.token_ttl = hours(env.parsed_or("GEEKWEAR_TOKEN_TTL_HOURS", 24)?);
        config.token_max_age = hours(env.parsed_or("GEEKWEAR_TOKEN_MAX_AGE_HOURS", 24)?);
        config.cookie_secure = env.parsed_or("GEEKWEAR_COOKIE_SECURE", true)?;
        config.privileged_emails = env
            .optional("GEEKWEAR_PRIVILEGED_EMAILS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        config.sign_in_per_minute = env.parsed_or("GEEKWEAR_SIGN_IN_PER_MINUTE", config.sign_in_per_minute)?;

        config.validate()?;
        Ok(config)
    }

    /// Check relationships between settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidEnvVar(
                "GEEKWEAR_HEARTBEAT_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.leader_stale_after <= self.heartbeat_interval {
            return Err(ConfigError::InvalidEnvVar(
                "GEEKWEAR_LEADER_STALE_MS".to_string(),
                format!(
                    "must exceed the heartbeat interval ({}ms)",
                    self.heartbeat_interval.as_millis()
                ),
            ));
        }
        if self.token_ttl.is_zero() || self.token_max_age.is_zero() {
            return Err(ConfigError::InvalidEnvVar(
                "GEEKWEAR_TOKEN_TTL_HOURS".to_string(),
                "token lifetimes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Get an optional variable; blank values count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key).map_or(Ok(default), |raw| {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
        })
    }

    /// Load and validate a secret.
    fn validated_secret(&self, key: &str) -> Result<SecretString, ConfigError> {
        let secret = SecretString::from(self.required(key)?);
        validate_secret_length(&secret, key)?;
        validate_secret_strength(secret.expose_secret(), key)?;
        Ok(secret)
    }
}

const fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 60 * 60)
}

fn random_secret() -> SecretString {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    SecretString::from(URL_SAFE_NO_PAD.encode(bytes))
}

/// Validate that a secret meets minimum length requirements.
fn validate_secret_length(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_SECRET_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {} characters (got {})",
                MIN_SECRET_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // Secret length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)]
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    if let Some(pattern) = PLACEHOLDER_PATTERNS.iter().find(|p| lower.contains(**p)) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("appears to be a placeholder (contains '{pattern}')"),
        ));
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TOKEN_SECRET: &str = "aB3$xY9!mK2@nL5#pQ7&rT0*uW4^zC6%";
    const STORAGE_KEY: &str = "Zq8!wE4@rT6#yU1$iO3%pA5^sD7&fG9*";

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn secrets() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GEEKWEAR_TOKEN_SECRET", TOKEN_SECRET),
            ("GEEKWEAR_STORAGE_KEY", STORAGE_KEY),
        ]
    }

    #[test]
    fn test_shannon_entropy_empty() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shannon_entropy_two_chars() {
        let entropy = shannon_entropy("ab");
        assert!((entropy - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_validate_secret_strength_placeholder() {
        let err = validate_secret_strength("your-token-secret-goes-here-now!!", "TEST_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_validate_secret_strength_low_entropy() {
        let err = validate_secret_strength("abababababababababababababababab", "TEST_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_lookup(lookup(&secrets())).unwrap();
        assert_eq!(config.channel_name, "geekwear-tab-sync");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.leader_stale_after, Duration::from_secs(10));
        assert_eq!(config.conflict_resync_delay, Duration::from_secs(1));
        assert!(config.broadcast_enabled);
        assert_eq!(config.token_ttl, Duration::from_secs(86_400));
        assert_eq!(config.sign_in_per_minute.get(), 10);
        assert!(config.privileged_emails.is_empty());
    }

    #[test]
    fn test_overrides() {
        let mut vars = secrets();
        vars.extend([
            ("GEEKWEAR_CHANNEL_NAME", "gamevault"),
            ("GEEKWEAR_HEARTBEAT_MS", "1000"),
            ("GEEKWEAR_LEADER_STALE_MS", "3000"),
            ("GEEKWEAR_BROADCAST_ENABLED", "false"),
            ("GEEKWEAR_PRIVILEGED_EMAILS", "owner@geekwear.test, ,ops@geekwear.test"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.channel_name, "gamevault");
        assert_eq!(config.leader_stale_after, Duration::from_secs(3));
        assert!(!config.broadcast_enabled);
        assert_eq!(config.privileged_emails, vec!["owner@geekwear.test", "ops@geekwear.test"]);
    }

    #[test]
    fn test_missing_secret() {
        let err = SyncConfig::from_lookup(lookup(&[("GEEKWEAR_TOKEN_SECRET", TOKEN_SECRET)])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "GEEKWEAR_STORAGE_KEY"));
    }

    #[test]
    fn test_short_secret() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("GEEKWEAR_TOKEN_SECRET", "aB3$xY9!"),
            ("GEEKWEAR_STORAGE_KEY", STORAGE_KEY),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_stale_must_exceed_heartbeat() {
        let mut vars = secrets();
        vars.extend([("GEEKWEAR_HEARTBEAT_MS", "5000"), ("GEEKWEAR_LEADER_STALE_MS", "5000")]);
        let err = SyncConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(key, _) if key == "GEEKWEAR_LEADER_STALE_MS"));
    }

    #[test]
    fn test_unparseable_number() {
        let mut vars = secrets();
        vars.push(("GEEKWEAR_SIGN_IN_PER_MINUTE", "0"));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = SyncConfig::from_lookup(lookup(&secrets())).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains(TOKEN_SECRET));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_ephemeral_secrets_differ() {
        let a = SyncConfig::ephemeral();
        let b = SyncConfig::ephemeral();
        assert_ne!(a.token_secret.expose_secret(), b.token_secret.expose_secret());
        assert!(a.validate().is_ok());
    }
}
