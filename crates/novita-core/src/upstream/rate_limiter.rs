// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Token-bucket rate limiter guarding outbound upstream calls, plus the
//! bounded-wait semaphore that serializes them into the adapter's request
//! queue.

use crate::error::CoreError;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket admitting `capacity` requests per `refill_period` (the
/// spec's "100 req/min" default is `capacity=100, refill_period=60s`).
pub struct RateLimiter {
    capacity: f64,
    refill_per_ms: f64,
    bucket: Mutex<Bucket>,
    queue_slots: Semaphore,
    max_queue_wait: Duration,
}

impl RateLimiter {
    /// Construct a limiter. `max_in_flight` bounds the FIFO request queue
    /// (§4.2 item 2); callers that wait longer than `max_queue_wait` fail
    /// fast with [`CoreError::CircuitOpen`]-adjacent semantics rather than
    /// queuing indefinitely.
    pub fn new(
        capacity: u32,
        refill_period: Duration,
        max_in_flight: usize,
        max_queue_wait: Duration,
    ) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_ms: capacity as f64 / refill_period.as_millis().max(1) as f64,
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            queue_slots: Semaphore::new(max_in_flight),
            max_queue_wait,
        }
    }

    fn refill(&self) {
        let mut bucket = self.bucket.lock().unwrap();
        let elapsed_ms = bucket.last_refill.elapsed().as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        bucket.last_refill = Instant::now();
    }

    fn try_take(&self) -> bool {
        self.refill();
        let mut bucket = self.bucket.lock().unwrap();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Acquire a request queue slot and a rate-limit token, waiting up to
    /// `max_queue_wait` total. Returns a guard that releases the queue slot
    /// on drop.
    pub async fn acquire(&self) -> Result<RateLimitPermit<'_>, CoreError> {
        let deadline = Instant::now() + self.max_queue_wait;
        let permit = tokio::time::timeout(self.max_queue_wait, self.queue_slots.acquire())
            .await
            .map_err(|_| CoreError::UpstreamTimeout {
                operation: "request_queue_wait".to_string(),
            })?
            .expect("semaphore is never closed");

        loop {
            if self.try_take() {
                return Ok(RateLimitPermit { _permit: permit });
            }
            if Instant::now() >= deadline {
                return Err(CoreError::UpstreamRateLimit { retry_after: None });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Held while a request occupies a request-queue slot.
pub struct RateLimitPermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60), 10, Duration::from_secs(1));
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
    }

    #[tokio::test]
    async fn exhausted_bucket_eventually_times_out() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600), 10, Duration::from_millis(50));
        limiter.acquire().await.unwrap();
        let result = limiter.acquire().await;
        assert!(result.is_err());
    }
}
