//! Lease quota enforcement
//!
//! Three independent limits gate every background issuance:
//!
//! - `tokensPerHour`: hard cap over a sliding hour window;
//! - `sendsPerMinute` with `burstSends`: a token bucket of capacity
//!   `burstSends` refilled at `sendsPerMinute / 60` tokens per second;
//! - `sendsPerMinutePerEid`: sliding minute window per endpoint label.
//!
//! A rejection charges nothing; an acceptance charges all applicable
//! windows. State is persisted with the lease so limits survive restarts.

use ats_kms_core::records::{LeaseQuotas, QuotaState};
use ats_kms_core::{KmsError, Result};

const HOUR_MS: u64 = 3_600_000;
const MINUTE_MS: u64 = 60_000;

/// Charge one issuance against the lease's quota state
pub fn charge(
    state: &mut QuotaState,
    quotas: &LeaseQuotas,
    now_ms: u64,
    eid: Option<&str>,
) -> Result<()> {
    // Sliding hour window.
    let hour_start = now_ms.saturating_sub(HOUR_MS);
    state.hour_window.retain(|&at| at >= hour_start);
    if state.hour_window.len() as u32 >= quotas.tokens_per_hour {
        return Err(KmsError::quota(format!(
            "tokensPerHour limit of {} reached",
            quotas.tokens_per_hour
        )));
    }

    // Token bucket.
    let elapsed_ms = now_ms.saturating_sub(state.bucket_refilled_at);
    let refill = elapsed_ms as f64 / 1_000.0 * (quotas.sends_per_minute as f64 / 60.0);
    state.bucket_tokens = (state.bucket_tokens + refill).min(quotas.burst_sends as f64);
    state.bucket_refilled_at = now_ms;
    if state.bucket_tokens < 1.0 {
        return Err(KmsError::quota(format!(
            "sendsPerMinute limit of {} (burst {}) reached",
            quotas.sends_per_minute, quotas.burst_sends
        )));
    }

    // Per-endpoint-label minute window.
    if let Some(eid) = eid {
        let minute_start = now_ms.saturating_sub(MINUTE_MS);
        let window = state.eid_windows.entry(eid.to_string()).or_default();
        window.retain(|&at| at >= minute_start);
        if window.len() as u32 >= quotas.sends_per_minute_per_eid {
            return Err(KmsError::quota(format!(
                "sendsPerMinutePerEid limit of {} reached for {eid}",
                quotas.sends_per_minute_per_eid
            )));
        }
        window.push(now_ms);
    }

    state.bucket_tokens -= 1.0;
    state.hour_window.push(now_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas() -> LeaseQuotas {
        LeaseQuotas {
            tokens_per_hour: 100,
            sends_per_minute: 60,
            burst_sends: 100,
            sends_per_minute_per_eid: 30,
        }
    }

    #[test]
    fn hundred_then_quota_exceeded() {
        let mut state = QuotaState::default();
        let quotas = quotas();
        let now = 1_000_000;
        for _ in 0..100 {
            charge(&mut state, &quotas, now, None).unwrap();
        }
        let err = charge(&mut state, &quotas, now, None).unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert!(err.to_string().contains("tokensPerHour"));
    }

    #[test]
    fn hour_window_slides() {
        let mut state = QuotaState::default();
        let quotas = quotas();
        for _ in 0..100 {
            charge(&mut state, &quotas, 1_000_000, None).unwrap();
        }
        // One hour later the window is clear again (bucket has refilled too).
        charge(&mut state, &quotas, 1_000_000 + HOUR_MS, None).unwrap();
    }

    #[test]
    fn bucket_exhausts_at_burst_then_refills() {
        let mut state = QuotaState::default();
        let quotas = LeaseQuotas {
            tokens_per_hour: 1_000,
            sends_per_minute: 60,
            burst_sends: 5,
            sends_per_minute_per_eid: 30,
        };
        let now = 1_000_000;
        for _ in 0..5 {
            charge(&mut state, &quotas, now, None).unwrap();
        }
        let err = charge(&mut state, &quotas, now, None).unwrap_err();
        assert!(err.to_string().contains("sendsPerMinute"));
        // 60/min = 1 token per second.
        charge(&mut state, &quotas, now + 1_000, None).unwrap();
    }

    #[test]
    fn per_eid_window_is_independent_per_label() {
        let mut state = QuotaState::default();
        let quotas = LeaseQuotas {
            tokens_per_hour: 1_000,
            sends_per_minute: 6_000,
            burst_sends: 1_000,
            sends_per_minute_per_eid: 2,
        };
        let now = 1_000_000;
        charge(&mut state, &quotas, now, Some("eid-a")).unwrap();
        charge(&mut state, &quotas, now, Some("eid-a")).unwrap();
        assert!(charge(&mut state, &quotas, now, Some("eid-a")).is_err());
        charge(&mut state, &quotas, now, Some("eid-b")).unwrap();
        // The label window slides on its own clock.
        charge(&mut state, &quotas, now + MINUTE_MS, Some("eid-a")).unwrap();
    }

    #[test]
    fn rejection_charges_nothing() {
        let mut state = QuotaState::default();
        let quotas = LeaseQuotas {
            tokens_per_hour: 1_000,
            sends_per_minute: 6_000,
            burst_sends: 1_000,
            sends_per_minute_per_eid: 1,
        };
        let now = 1_000_000;
        charge(&mut state, &quotas, now, Some("eid-a")).unwrap();
        let before_hour = state.hour_window.len();
        let before_tokens = state.bucket_tokens;
        assert!(charge(&mut state, &quotas, now, Some("eid-a")).is_err());
        assert_eq!(state.hour_window.len(), before_hour);
        assert_eq!(state.bucket_tokens, before_tokens);
    }
}
