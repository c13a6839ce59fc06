//! Per-email throttling of credential attempts.
//!
//! Runs on governor's own clock rather than the tab [`Clock`](crate::clock::Clock):
//! governor needs a monotonic instant. Tests substitute a
//! [`FakeRelativeClock`](governor::clock::FakeRelativeClock) through
//! [`SignInThrottle::with_clock`].

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock as GovernorClock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use geekwear_core::Email;

/// Limits password sign-in and sign-up attempts per normalized email.
pub struct SignInThrottle<C: GovernorClock = DefaultClock> {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, C, NoOpMiddleware<C::Instant>>,
    clock: C,
}

impl<C: GovernorClock> fmt::Debug for SignInThrottle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInThrottle")
            .field("tracked", &self.limiter.len())
            .finish_non_exhaustive()
    }
}

impl SignInThrottle {
    /// Allow `per_minute` attempts per email, refilling continuously.
    #[must_use]
    pub fn per_minute(per_minute: NonZeroU32) -> Self {
        Self::with_clock(per_minute, DefaultClock::default())
    }
}

impl<C: GovernorClock + Clone> SignInThrottle<C> {
    #[must_use]
    pub fn with_clock(per_minute: NonZeroU32, clock: C) -> Self {
        Self {
            limiter: RateLimiter::new(
                Quota::per_minute(per_minute),
                DefaultKeyedStateStore::default(),
                clock.clone(),
            ),
            clock,
        }
    }

    /// Record an attempt for `email`.
    ///
    /// # Errors
    ///
    /// Returns the time to wait before the next attempt is allowed.
    pub fn check(&self, email: &Email) -> Result<(), Duration> {
        let key = email.normalized();
        self.limiter.check_key(&key).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            tracing::warn!(email = %key, retry_after_ms = wait.as_millis(), "sign-in attempts throttled");
            wait
        })?;
        self.limiter.retain_recent();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use governor::clock::FakeRelativeClock;

    use super::*;

    #[test]
    fn test_quota_per_email() {
        let throttle = SignInThrottle::per_minute(NonZeroU32::new(3).unwrap());
        let link = Email::parse("link@hyrule.example").unwrap();
        let zelda = Email::parse("zelda@hyrule.example").unwrap();

        for _ in 0..3 {
            throttle.check(&link).unwrap();
        }
        let wait = throttle.check(&Email::parse("LINK@hyrule.example").unwrap()).unwrap_err();
        assert!(wait > Duration::ZERO);

        throttle.check(&zelda).unwrap();
    }

    #[test]
    fn test_quota_refills_over_time() {
        let clock = FakeRelativeClock::default();
        let throttle = SignInThrottle::with_clock(NonZeroU32::new(3).unwrap(), clock.clone());
        let link = Email::parse("link@hyrule.example").unwrap();

        for _ in 0..3 {
            throttle.check(&link).unwrap();
        }
        let wait = throttle.check(&link).unwrap_err();
        assert_eq!(wait, Duration::from_secs(20));

        clock.advance(Duration::from_secs(10));
        assert_eq!(throttle.check(&link).unwrap_err(), Duration::from_secs(10));

        clock.advance(Duration::from_secs(10));
        throttle.check(&link).unwrap();
        assert!(throttle.check(&link).is_err());
    }
}
