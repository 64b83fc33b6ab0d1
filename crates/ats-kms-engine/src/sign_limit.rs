//! Per-key signing throttle
//!
//! Hard cap of `max_per_hour` user-authenticated signatures per key, with a
//! log warning once the short-window count crosses the alert threshold.

use std::collections::HashMap;

use ats_kms_core::config::SignLimitConfig;
use ats_kms_core::{KmsError, Result};

const HOUR_MS: u64 = 3_600_000;

/// Sliding-window signature counter per kid
#[derive(Debug)]
pub struct SignRateLimiter {
    config: SignLimitConfig,
    windows: HashMap<String, Vec<u64>>,
}

impl SignRateLimiter {
    /// Create a limiter with the given knobs
    pub fn new(config: SignLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Charge one signature against the key's hour window
    pub fn charge(&mut self, kid: &str, now_ms: u64) -> Result<()> {
        let window = self.windows.entry(kid.to_string()).or_default();
        let hour_start = now_ms.saturating_sub(HOUR_MS);
        window.retain(|&at| at >= hour_start);
        if window.len() as u32 >= self.config.max_per_hour {
            let retry_after_ms = window
                .first()
                .map(|&oldest| (oldest + HOUR_MS).saturating_sub(now_ms))
                .unwrap_or(HOUR_MS);
            return Err(KmsError::RateLimited {
                retry_after_secs: retry_after_ms.div_ceil(1_000),
            });
        }
        window.push(now_ms);

        let warn_start = now_ms.saturating_sub(self.config.warn_window_secs * 1_000);
        let recent = window.iter().filter(|&&at| at >= warn_start).count() as u32;
        if recent > self.config.warn_threshold {
            tracing::warn!(kid, recent, "elevated signing rate");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_max_per_hour() {
        let mut limiter = SignRateLimiter::new(SignLimitConfig::default());
        for i in 0..100 {
            limiter.charge("kid-1", i).unwrap();
        }
        let err = limiter.charge("kid-1", 200).unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        // Other keys are unaffected.
        limiter.charge("kid-2", 200).unwrap();
        // An hour later the window has slid.
        limiter.charge("kid-1", 100 + HOUR_MS).unwrap();
    }
}
