use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::response::IntoResponse;
use tracing::debug;

use super::{client_ip, Handler, Stage};
use crate::error::GatewayError;

/// Token bucket for a single client. Tokens are fractional; refill accrues
/// continuously and is capped at the bucket capacity.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Refill, then try to consume one token.
    fn allow(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return true;
        }
        false
    }
}

/// Token-bucket rate limiter keyed by client identity. One exclusive lock
/// covers the identity map and the bucket it yields; the critical section is
/// a map lookup plus the bucket arithmetic.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    max_tokens: f64,
    refill_rate: f64,
}

impl RateLimiter {
    /// `max_tokens` is the burst size; `refill_rate` the sustained
    /// tokens-per-second rate.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_tokens,
            refill_rate,
        }
    }

    /// Burst capacity this limiter was built with.
    pub fn capacity(&self) -> f64 {
        self.max_tokens
    }

    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    fn allow_at(&self, identity: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens, self.refill_rate, now))
            .allow(now)
    }
}

/// Static rate-limit stage: one bucket per client IP, 429 on exhaustion.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Stage for RateLimitStage {
    fn wrap(&self, next: Handler) -> Handler {
        let limiter = self.limiter.clone();
        Handler::new(move |req| {
            let next = next.clone();
            let limiter = limiter.clone();
            async move {
                let identity = client_ip(&req);
                if !limiter.allow(&identity) {
                    debug!(client = %identity, "rate limit exceeded");
                    return GatewayError::RateLimited.into_response();
                }
                next.call(req).await
            }
        })
    }
}
