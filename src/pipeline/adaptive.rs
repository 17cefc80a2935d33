use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::response::IntoResponse;
use tracing::{debug, info};

use super::rate_limit::RateLimiter;
use super::{client_ip, Handler, Stage};
use crate::analytics::Analyzer;
use crate::config::AdaptiveRateLimitConfig;
use crate::error::GatewayError;
use crate::proxy::RouteTable;

const REBALANCE_EVERY: Duration = Duration::from_secs(5 * 60);
const MIN_SAMPLE_SIZE: usize = 5;

/// Wraps the static rate limiter with per-route limits learned from traffic
/// baselines. Until the analyzer has a full window of history (and a route
/// has enough samples), requests fall through to the static limiter so the
/// gateway stays protected during cold start.
pub struct AdaptiveRateLimiter {
    static_limiter: Arc<RateLimiter>,
    analyzer: Arc<Analyzer>,
    routes: Arc<RouteTable>,
    config: AdaptiveRateLimitConfig,
    route_limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    last_rebalance: Mutex<Option<Instant>>,
}

impl AdaptiveRateLimiter {
    pub fn new(
        static_limiter: Arc<RateLimiter>,
        analyzer: Arc<Analyzer>,
        routes: Arc<RouteTable>,
        config: AdaptiveRateLimitConfig,
    ) -> Self {
        Self {
            static_limiter,
            analyzer,
            routes,
            config,
            route_limiters: RwLock::new(HashMap::new()),
            last_rebalance: Mutex::new(None),
        }
    }

    /// The limit (tokens per minute) currently learned for a route, if the
    /// route has enough history.
    pub fn current_limit(&self, route: &str) -> Option<f64> {
        let baseline = self.analyzer.route_baseline(route)?;
        if baseline.sample_size < MIN_SAMPLE_SIZE {
            return None;
        }
        Some(self.clamp(baseline.mean_rate * self.config.multiplier))
    }

    fn clamp(&self, limit: f64) -> f64 {
        limit.max(self.config.min_limit).min(self.config.max_limit)
    }

    /// True while requests must be handled by the static limiter.
    fn learning(&self) -> bool {
        !self.config.enabled
            || !self.analyzer.has_sufficient_data()
            || self.analyzer.age() < self.config.learning_period
    }

    /// Recompute per-route limiters from the latest baselines. A route's
    /// limiter is replaced only when its limit actually changed, so token
    /// state survives rebalances with identical output.
    pub fn rebalance(&self) {
        let baselines = self.analyzer.all_route_baselines();
        let mut limiters = self.route_limiters.write().unwrap();

        for (route, baseline) in baselines {
            if baseline.sample_size < MIN_SAMPLE_SIZE {
                continue;
            }

            let limit = self.clamp(baseline.mean_rate * self.config.multiplier);
            let refill_rate = limit / 60.0;

            let needs_replace = limiters
                .get(&route)
                .map(|existing| existing.capacity() != limit)
                .unwrap_or(true);
            if needs_replace {
                info!(
                    route = %route,
                    limit_per_min = limit,
                    mean_rate = baseline.mean_rate,
                    multiplier = self.config.multiplier,
                    "adaptive rate limit updated"
                );
                limiters.insert(route, Arc::new(RateLimiter::new(limit, refill_rate)));
            }
        }

        *self.last_rebalance.lock().unwrap() = Some(Instant::now());
    }

    fn maybe_rebalance(&self) {
        let due = {
            let last = self.last_rebalance.lock().unwrap();
            last.map(|t| t.elapsed() > REBALANCE_EVERY).unwrap_or(true)
        };
        if due {
            self.rebalance();
        }
    }

    /// Rate-limit decision for one request.
    pub fn allow(&self, path: &str, identity: &str) -> bool {
        if self.learning() {
            return self.static_limiter.allow(identity);
        }

        self.maybe_rebalance();

        let route = self.routes.normalize(path);
        let limiter = self.route_limiters.read().unwrap().get(&route).cloned();
        match limiter {
            Some(limiter) => limiter.allow(identity),
            // No learned limit for this route yet.
            None => self.static_limiter.allow(identity),
        }
    }
}

/// Pipeline stage delegating to [`AdaptiveRateLimiter::allow`].
pub struct AdaptiveRateLimitStage {
    limiter: Arc<AdaptiveRateLimiter>,
}

impl AdaptiveRateLimitStage {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Stage for AdaptiveRateLimitStage {
    fn wrap(&self, next: Handler) -> Handler {
        let limiter = self.limiter.clone();
        Handler::new(move |req| {
            let next = next.clone();
            let limiter = limiter.clone();
            async move {
                let identity = client_ip(&req);
                if !limiter.allow(req.uri().path(), &identity) {
                    debug!(client = %identity, path = %req.uri().path(), "adaptive rate limit exceeded");
                    return GatewayError::RateLimited.into_response();
                }
                next.call(req).await
            }
        })
    }
}
