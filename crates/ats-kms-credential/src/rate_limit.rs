//! Unlock attempt throttling
//!
//! At most `max_failures` failed unlocks per user inside the rolling
//! window; exhausting the window starts a cooldown during which every
//! attempt fails fast, before any KDF work.

use std::collections::HashMap;

use ats_kms_core::config::UnlockLimitConfig;
use ats_kms_core::{KmsError, Result};

/// Per-user failure window and cooldown tracking
#[derive(Debug)]
pub struct UnlockRateLimiter {
    config: UnlockLimitConfig,
    failures: HashMap<String, Vec<u64>>,
    cooldown_until: HashMap<String, u64>,
}

impl UnlockRateLimiter {
    /// Create a limiter with the given knobs
    pub fn new(config: UnlockLimitConfig) -> Self {
        Self {
            config,
            failures: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    /// Fail fast if the user is cooling down
    pub fn check(&mut self, user_id: &str, now_ms: u64) -> Result<()> {
        if let Some(&until) = self.cooldown_until.get(user_id) {
            if now_ms < until {
                return Err(KmsError::RateLimited {
                    retry_after_secs: (until - now_ms).div_ceil(1_000),
                });
            }
            self.cooldown_until.remove(user_id);
        }
        Ok(())
    }

    /// Record a failed attempt; starts the cooldown when the window fills
    pub fn record_failure(&mut self, user_id: &str, now_ms: u64) {
        let window_start = now_ms.saturating_sub(self.config.window_secs * 1_000);
        let failures = self.failures.entry(user_id.to_string()).or_default();
        failures.retain(|&at| at >= window_start);
        failures.push(now_ms);
        if failures.len() as u32 >= self.config.max_failures {
            self.cooldown_until.insert(
                user_id.to_string(),
                now_ms + self.config.cooldown_secs * 1_000,
            );
            failures.clear();
            tracing::warn!(user_id, "unlock attempts exhausted; cooldown engaged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> UnlockRateLimiter {
        UnlockRateLimiter::new(UnlockLimitConfig {
            max_failures: 5,
            window_secs: 300,
            cooldown_secs: 3600,
        })
    }

    #[test]
    fn five_failures_inside_window_trigger_cooldown() {
        let mut limiter = limiter();
        for i in 0..4 {
            limiter.record_failure("u1", i * 1_000);
            assert!(limiter.check("u1", i * 1_000).is_ok());
        }
        limiter.record_failure("u1", 4_000);
        let err = limiter.check("u1", 5_000).unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
    }

    #[test]
    fn cooldown_lapses_after_an_hour() {
        let mut limiter = limiter();
        for i in 0..5 {
            limiter.record_failure("u1", i);
        }
        assert!(limiter.check("u1", 10_000).is_err());
        assert!(limiter.check("u1", 4 + 3600 * 1_000).is_ok());
    }

    #[test]
    fn old_failures_age_out_of_the_window() {
        let mut limiter = limiter();
        for i in 0..4 {
            limiter.record_failure("u1", i);
        }
        // Four early failures expire; one more at t+6min stays under the cap.
        limiter.record_failure("u1", 360_000);
        assert!(limiter.check("u1", 361_000).is_ok());
    }

    #[test]
    fn users_are_isolated() {
        let mut limiter = limiter();
        for i in 0..5 {
            limiter.record_failure("u1", i);
        }
        assert!(limiter.check("u2", 10).is_ok());
    }
}
