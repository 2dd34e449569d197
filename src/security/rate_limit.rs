//! Token-bucket rate limiting.
//!
//! Each key owns a bucket of `capacity` tokens refilled continuously at
//! `refill_per_sec`. Buckets live in a sharded [`DashMap`], each behind its
//! own mutex: the map lock is only held long enough to clone the bucket
//! handle out, and the check-and-decrement happens under the bucket's lock
//! alone, so unrelated keys never contend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::BoxFuture;
use crate::context::RequestContext;
use crate::error::Rejection;
use crate::http::Response;
use crate::middleware::{Flow, Stage, StageError};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    /// Set under the bucket lock when the sweeper removes it from the map.
    evicted: bool,
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed {
        /// Whole tokens left after this request.
        remaining: u32,
    },
    Limited {
        /// When the next token arrives; `None` if the bucket never refills.
        retry_after: Option<Duration>,
    },
}

/// Per-key token buckets.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_per_sec: f64,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// Takes one token from `key`'s bucket as of `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        loop {
            let bucket = self.bucket(key, now);
            let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
            // Evicted between the map lookup and the lock; start over with
            // whatever the map holds now.
            if bucket.evicted {
                continue;
            }
            return self.take(&mut bucket, now);
        }
    }

    fn take(&self, bucket: &mut Bucket, now: Instant) -> Decision {
        let capacity = f64::from(self.capacity);
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Decision::Allowed {
                remaining: bucket.tokens.floor() as u32,
            };
        }

        // A positive but tiny refill rate can put the next token beyond
        // what `Duration` represents; treat that like no refill at all.
        let retry_after = (self.refill_per_sec > 0.0)
            .then(|| Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec).ok())
            .flatten();
        Decision::Limited { retry_after }
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(&bucket);
        }
        let capacity = f64::from(self.capacity);
        let entry = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
                evicted: false,
            }))
        });
        Arc::clone(&entry)
    }

    /// Drops buckets untouched for `stale_after` that would be full again
    /// by `now`. Such a bucket is indistinguishable from a fresh one, so
    /// evicting it never changes a later decision. Returns how many went.
    pub fn evict_stale(&self, now: Instant, stale_after: Duration) -> usize {
        let capacity = f64::from(self.capacity);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let Ok(mut bucket) = bucket.try_lock() else {
                return true;
            };
            let idle = now.saturating_duration_since(bucket.last_refill);
            let refilled = bucket.tokens + idle.as_secs_f64() * self.refill_per_sec;
            let keep = idle < stale_after || refilled < capacity;
            bucket.evicted = !keep;
            keep
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Where the rate-limit key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// The client's IP address.
    #[default]
    PeerAddr,
    /// The value of a request header, falling back to the IP address when
    /// the header is missing or empty.
    Header(String),
}

impl KeyStrategy {
    pub fn key_for(&self, ctx: &RequestContext) -> String {
        if let KeyStrategy::Header(name) = self {
            if let Some(value) = ctx.headers().get(name).map(str::trim).filter(|v| !v.is_empty()) {
                return value.to_owned();
            }
        }
        ctx.peer_addr().ip().to_string()
    }
}

#[derive(Debug, Clone, Copy)]
struct Remaining(u32);

/// Rejects requests whose key has run out of tokens, and reports the
/// remaining budget on allowed responses.
#[derive(Debug, Clone)]
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    key: KeyStrategy,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>, key: KeyStrategy) -> Self {
        Self { limiter, key }
    }
}

impl Stage for RateLimitStage {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        let key = self.key.key_for(ctx);
        let flow = match self.limiter.check(&key) {
            Decision::Allowed { remaining } => {
                ctx.extensions_mut().insert(Remaining(remaining));
                Flow::Continue
            }
            Decision::Limited { retry_after } => {
                debug!(key = %key, retry_after = ?retry_after, "rate limited");
                Flow::Respond(Rejection::RateLimited { retry_after }.into_response())
            }
        };
        Box::pin(async move { Ok(flow) })
    }

    fn after<'a>(
        &'a self,
        ctx: &'a RequestContext,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        if let Some(Remaining(remaining)) = ctx.extensions().get::<Remaining>().copied() {
            response.set_header("X-RateLimit-Limit", self.limiter.capacity().to_string());
            response.set_header("X-RateLimit-Remaining", remaining.to_string());
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::http::StatusCode;
    use crate::middleware::{MiddlewareStage, Pipeline, Target};

    #[test]
    fn capacity_two_no_refill_scenario() {
        let limiter = RateLimiter::new(2, 0.0);
        let now = Instant::now();
        assert_eq!(limiter.check_at("k", now), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.check_at("k", now), Decision::Allowed { remaining: 0 });
        assert_eq!(
            limiter.check_at("k", now),
            Decision::Limited { retry_after: None }
        );
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 0.0);
        assert!(matches!(limiter.check("a"), Decision::Allowed { .. }));
        assert!(matches!(limiter.check("b"), Decision::Allowed { .. }));
        assert!(matches!(limiter.check("a"), Decision::Limited { .. }));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn refill_is_continuous_and_capped() {
        let limiter = RateLimiter::new(3, 2.0);
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(matches!(limiter.check_at("k", t0), Decision::Allowed { .. }));
        }
        assert_eq!(
            limiter.check_at("k", t0),
            Decision::Limited {
                retry_after: Some(Duration::from_millis(500))
            }
        );
        assert!(matches!(
            limiter.check_at("k", t0 + Duration::from_millis(500)),
            Decision::Allowed { remaining: 0 }
        ));

        // A long idle period refills to capacity, never beyond it.
        let later = t0 + Duration::from_secs(3600);
        assert_eq!(limiter.check_at("k", later), Decision::Allowed { remaining: 2 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_checks_allow_exactly_capacity() {
        let limiter = Arc::new(RateLimiter::new(10, 0.0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let limiter = Arc::clone(&limiter);
            tasks.spawn(async move { limiter.check("shared") });
        }

        let mut allowed = 0;
        let mut limited = 0;
        while let Some(decision) = tasks.join_next().await {
            match decision.unwrap() {
                Decision::Allowed { .. } => allowed += 1,
                Decision::Limited { .. } => limited += 1,
            }
        }
        assert_eq!((allowed, limited), (10, 54));
    }

    #[test]
    fn eviction_only_drops_buckets_that_are_full_again() {
        let stale = Duration::from_secs(600);
        let t0 = Instant::now();

        let refilling = RateLimiter::new(5, 1.0);
        refilling.check_at("idle", t0);
        refilling.check_at("busy", t0 + stale);
        assert_eq!(refilling.evict_stale(t0 + stale + Duration::from_secs(1), stale), 1);
        assert_eq!(refilling.len(), 1);

        let fixed = RateLimiter::new(5, 0.0);
        fixed.check_at("spent", t0);
        assert_eq!(fixed.evict_stale(t0 + stale * 10, stale), 0);
    }

    #[test]
    fn tiny_refill_rate_limits_without_retry_hint() {
        let limiter = RateLimiter::new(1, 1e-20);
        let now = Instant::now();
        assert_eq!(limiter.check_at("k", now), Decision::Allowed { remaining: 0 });
        assert_eq!(
            limiter.check_at("k", now),
            Decision::Limited { retry_after: None }
        );
    }

    #[test]
    fn check_retries_when_its_bucket_was_evicted() {
        let stale = Duration::from_secs(60);
        let t0 = Instant::now();
        let limiter = RateLimiter::new(1, 1.0);
        limiter.check_at("k", t0);

        // Hold a handle the way `check_at` does between lookup and lock.
        let orphan = limiter.bucket("k", t0);
        let later = t0 + stale * 2;
        assert_eq!(limiter.evict_stale(later, stale), 1);
        assert!(orphan.lock().unwrap().evicted);

        assert_eq!(limiter.check_at("k", later), Decision::Allowed { remaining: 0 });
        assert_eq!(
            limiter.check_at("k", later),
            Decision::Limited {
                retry_after: Some(Duration::from_secs(1))
            }
        );
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn header_strategy_falls_back_to_peer() {
        let strategy = KeyStrategy::Header("X-Api-Key".into());
        let with_key = context("GET", "/", &[("X-Api-Key", "team-a")]);
        let without = context("GET", "/", &[]);
        assert_eq!(strategy.key_for(&with_key), "team-a");
        assert_eq!(strategy.key_for(&without), "10.0.0.7");
        assert_eq!(KeyStrategy::PeerAddr.key_for(&with_key), "10.0.0.7");
    }

    #[tokio::test]
    async fn stage_rejects_third_request_and_reports_budget() {
        let stage = RateLimitStage::new(Arc::new(RateLimiter::new(2, 0.0)), KeyStrategy::PeerAddr);
        let pipeline = Pipeline::builder()
            .stage(MiddlewareStage::new("rate-limit", 50, stage))
            .build()
            .unwrap();

        let mut statuses = Vec::new();
        let mut remaining = Vec::new();
        for _ in 0..3 {
            let outcome = pipeline
                .execute(
                    context("GET", "/", &[]),
                    Target::Respond(Response::new(StatusCode::Ok)),
                    std::future::pending(),
                )
                .await;
            statuses.push(outcome.response.status());
            remaining.push(
                outcome
                    .response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .map(str::to_owned),
            );
        }

        assert_eq!(
            statuses,
            [StatusCode::Ok, StatusCode::Ok, StatusCode::TooManyRequests]
        );
        assert_eq!(remaining, [Some("1".into()), Some("0".into()), None]);
    }
}
