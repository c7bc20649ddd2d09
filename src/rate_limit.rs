//! Token bucket rate limiting per provider key.
//!
//! The bucket math lives in [`BucketState`]; persistence is behind
//! [`RateLimitStore`]. Every store must apply refill + take as one atomic
//! read-modify-write: the in-memory store holds a mutex across it, the
//! Postgres store a `SELECT ... FOR UPDATE` transaction. Without that two
//! workers can both spend the last token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderLimit;
use crate::error::{ProviderError, StoreError};

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_secs: f64,
}

impl Decision {
    pub const ALLOW: Decision = Decision {
        allowed: true,
        retry_after_secs: 0.0,
    };

    pub fn deny(retry_after_secs: f64) -> Self {
        Self {
            allowed: false,
            retry_after_secs,
        }
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs_f64(self.retry_after_secs.max(0.0))
    }
}

/// Persisted bucket row (`rate_limits` table).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl BucketState {
    /// New buckets start full.
    pub fn full(burst: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: effective_burst(burst),
            last_refill_at: now,
        }
    }

    /// Refill for the elapsed time, then try to take one token.
    ///
    /// `max_rps <= 0` means the key is unlimited and the state is left alone.
    pub fn attempt(&mut self, now: DateTime<Utc>, max_rps: f64, burst: f64) -> Decision {
        if max_rps <= 0.0 || !max_rps.is_finite() {
            return Decision::ALLOW;
        }
        let burst = effective_burst(burst);
        let elapsed = (now - self.last_refill_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.tokens = (self.tokens + elapsed * max_rps).min(burst);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::ALLOW
        } else {
            Decision::deny((1.0 - self.tokens) / max_rps)
        }
    }
}

// A bucket that can never hold a whole token would deny forever.
fn effective_burst(burst: f64) -> f64 {
    if burst.is_finite() {
        burst.max(1.0)
    } else {
        1.0
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically refill and take from the bucket for `key`.
    async fn attempt(
        &self,
        key: &str,
        max_rps: f64,
        burst: f64,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError>;
}

/// Process-local buckets behind one mutex. Correct for a single worker
/// process; multi-process deployments need the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        self.buckets.lock().ok()?.get(key).copied()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn attempt(
        &self,
        key: &str,
        max_rps: f64,
        burst: f64,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| StoreError::Conflict("rate limit mutex poisoned".into()))?;
        let state = buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState::full(burst, now));
        Ok(state.attempt(now, max_rps, burst))
    }
}

/// Facade used by provider clients and jobs.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()))
    }

    pub async fn attempt(&self, key: &str, limit: ProviderLimit) -> Result<Decision, StoreError> {
        self.attempt_at(key, limit, Utc::now()).await
    }

    pub async fn attempt_at(
        &self,
        key: &str,
        limit: ProviderLimit,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let decision = self
            .store
            .attempt(key, limit.max_rps, limit.burst, now)
            .await?;
        if !decision.allowed {
            debug!(
                provider = key,
                retry_after_secs = decision.retry_after_secs,
                "rate limit denied"
            );
        }
        Ok(decision)
    }

    /// Take a permit or fail with [`ProviderError::RateLimited`]. A broken
    /// limiter store counts as the provider being unavailable: calls are
    /// never made without a permit.
    pub async fn acquire(&self, key: &str, limit: ProviderLimit) -> Result<(), ProviderError> {
        let decision = self
            .attempt(key, limit)
            .await
            .map_err(|e| ProviderError::unavailable(key, format!("rate limiter: {e}")))?;
        if decision.allowed {
            Ok(())
        } else {
            Err(ProviderError::RateLimited {
                provider: key.to_string(),
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn one_per_second_allows_then_denies_then_recovers() {
        let limiter = RateLimiter::in_memory();
        let limit = ProviderLimit::new(1.0, 1.0);

        let first = limiter.attempt_at("rawg", limit, t0()).await.unwrap();
        assert!(first.allowed);

        let second = limiter.attempt_at("rawg", limit, t0()).await.unwrap();
        assert!(!second.allowed);
        assert!((second.retry_after_secs - 1.0).abs() < 1e-9);

        let later = t0() + chrono::Duration::milliseconds(1000);
        let third = limiter.attempt_at("rawg", limit, later).await.unwrap();
        assert!(third.allowed);
    }

    #[test]
    fn partial_refill_reports_remaining_wait() {
        let mut bucket = BucketState::full(2.0, t0());
        assert!(bucket.attempt(t0(), 2.0, 2.0).allowed);
        assert!(bucket.attempt(t0(), 2.0, 2.0).allowed);
        let denied = bucket.attempt(t0() + chrono::Duration::milliseconds(250), 2.0, 2.0);
        assert!(!denied.allowed);
        // 0.5 tokens accrued, half a token short at 2 rps
        assert!((denied.retry_after_secs - 0.25).abs() < 1e-9);
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let mut bucket = BucketState::full(3.0, t0());
        for _ in 0..3 {
            assert!(bucket.attempt(t0(), 1.0, 3.0).allowed);
        }
        let much_later = t0() + chrono::Duration::hours(1);
        bucket.attempt(much_later, 1.0, 3.0);
        assert!((bucket.tokens - 2.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_rate_is_unlimited() {
        let mut bucket = BucketState::full(1.0, t0());
        for _ in 0..10 {
            assert!(bucket.attempt(t0(), 0.0, 1.0).allowed);
        }
        assert_eq!(bucket.tokens, 1.0);
    }

    #[test]
    fn clock_skew_does_not_mint_tokens() {
        let mut bucket = BucketState::full(1.0, t0());
        assert!(bucket.attempt(t0(), 1.0, 1.0).allowed);
        let earlier = t0() - chrono::Duration::seconds(30);
        assert!(!bucket.attempt(earlier, 1.0, 1.0).allowed);
        assert_eq!(bucket.last_refill_at, t0());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_never_overspend() {
        let limiter = RateLimiter::in_memory();
        let limit = ProviderLimit::new(0.001, 3.0);
        let now = t0();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.attempt_at("tgdb", limit, now).await.unwrap() })
            })
            .collect();
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn acquire_maps_denial_to_rate_limited() {
        let limiter = RateLimiter::in_memory();
        let limit = ProviderLimit::new(1.0, 1.0);
        limiter.acquire("itad", limit).await.unwrap();
        match limiter.acquire("itad", limit).await {
            Err(ProviderError::RateLimited { provider, .. }) => assert_eq!(provider, "itad"),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }
}
