// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff with jitter, honoring an upstream `Retry-After` hint
//! when present.

use rand::Rng;
use std::time::Duration;

/// Computes the delay before retry attempt `attempt` (1-based), given a
/// `base` delay. Used by both the upstream adapter and the job queue's
/// `fail()` backoff so the two stay numerically consistent.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.saturating_sub(1).min(20));
    let jitter_frac = rand::thread_rng().gen_range(0.0..1.0);
    let jittered = exp as f64 * (1.0 + jitter_frac);
    Duration::from_millis(jittered as u64)
}

/// Same as [`backoff_delay`] but capped, and honoring an explicit
/// `Retry-After` when the upstream provided one (used for HTTP 429/503).
pub fn retry_delay(base: Duration, attempt: u32, retry_after: Option<Duration>, cap: Duration) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after.min(cap);
    }
    backoff_delay(base, attempt).min(cap)
}

/// Whether a network-level send error should be retried: connection
/// refused, reset, DNS failure, or timeout.
pub fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_base() {
        let base = Duration::from_secs(1);
        for attempt in 1..=4 {
            let delay = backoff_delay(base, attempt);
            let floor = base.as_millis() as u64 * (1u64 << (attempt - 1));
            let ceiling = floor * 2;
            assert!(
                delay.as_millis() as u64 >= floor && delay.as_millis() as u64 <= ceiling,
                "attempt {attempt}: delay {delay:?} outside [{floor}, {ceiling}]ms"
            );
        }
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let delay = retry_delay(
            Duration::from_secs(1),
            3,
            Some(Duration::from_secs(2)),
            Duration::from_secs(30),
        );
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn retry_delay_respects_cap() {
        let delay = retry_delay(Duration::from_secs(1), 10, None, Duration::from_secs(30));
        assert!(delay <= Duration::from_secs(30));
    }
}
