use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::response::IntoResponse;
use tracing::{info, warn};

use super::{Handler, Stage};
use crate::analytics::Analyzer;
use crate::error::GatewayError;
use crate::proxy::PROXY_BACKEND_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through.
    Closed,
    /// Tripped, requests rejected until the timeout passes.
    Open,
    /// One probe request in flight to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    /// Requests observed in the current window (resets on success).
    total_count: u64,
    last_failure: Option<Instant>,
}

/// Trips after repeated backend failures and fails fast until a timeout
/// passes, then lets a single request through to probe recovery. With an
/// analyzer attached the trip point auto-tunes to each backend's learned
/// error-rate baseline instead of the static failure count.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    timeout: Duration,
    analyzer: Option<Arc<Analyzer>>,
}

pub enum Admission {
    Allow,
    Reject,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                total_count: 0,
                last_failure: None,
            }),
            threshold,
            timeout,
            analyzer: None,
        }
    }

    /// Attach the analyzer that supplies per-backend error baselines.
    pub fn with_analyzer(mut self, analyzer: Arc<Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    /// Gate an incoming request. In the open state the request is rejected
    /// until the timeout elapses; the first request after that transitions
    /// to half-open and is let through as the probe.
    pub fn admit_at(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed <= self.timeout {
                    return Admission::Reject;
                }
                inner.state = CircuitState::HalfOpen;
                info!("circuit breaker half-open, probing backend");
                Admission::Allow
            }
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allow,
        }
    }

    pub fn record(&self, status: u16, backend: Option<&str>) {
        self.record_at(Instant::now(), status, backend);
    }

    /// Record the outcome of an admitted request. Any success closes the
    /// circuit and clears the counters; failures escalate per the current
    /// state and trip condition.
    pub fn record_at(&self, now: Instant, status: u16, backend: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_count += 1;

        if status >= 500 {
            inner.failure_count += 1;
            inner.last_failure = Some(now);

            if inner.state == CircuitState::HalfOpen {
                warn!("circuit breaker probe failed, reopening");
                inner.state = CircuitState::Open;
            } else if self.should_trip(&inner, backend) {
                warn!(
                    failures = inner.failure_count,
                    total = inner.total_count,
                    backend = backend.unwrap_or(""),
                    "circuit breaker opened"
                );
                inner.state = CircuitState::Open;
            }
        } else {
            inner.failure_count = 0;
            inner.total_count = 0;
            inner.state = CircuitState::Closed;
        }
    }

    fn should_trip(&self, inner: &BreakerInner, backend: Option<&str>) -> bool {
        if let Some(analyzer) = &self.analyzer {
            if analyzer.has_sufficient_data() && inner.total_count > 0 {
                let error_rate = inner.failure_count as f64 / inner.total_count as f64;
                return error_rate > self.dynamic_threshold(analyzer, backend);
            }
        }
        inner.failure_count >= self.threshold
    }

    /// Error-rate trip point for a backend: 5× its baseline error rate with
    /// a 5% floor, or a generous 50% when the backend has under two samples.
    fn dynamic_threshold(&self, analyzer: &Analyzer, backend: Option<&str>) -> f64 {
        let baseline = backend.and_then(|b| analyzer.backend_baseline(b));
        match baseline {
            Some(b) if b.sample_size >= 2 => (b.mean_error_rate * 5.0).max(0.05),
            _ => 0.5,
        }
    }
}

/// Pipeline stage: rejects with 503 while open, otherwise classifies the
/// observed response status and the backend attributed by the proxy.
pub struct CircuitBreakerStage {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerStage {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl Stage for CircuitBreakerStage {
    fn wrap(&self, next: Handler) -> Handler {
        let breaker = self.breaker.clone();
        Handler::new(move |req| {
            let next = next.clone();
            let breaker = breaker.clone();
            async move {
                if let Admission::Reject = breaker.admit() {
                    return GatewayError::CircuitOpen.into_response();
                }

                let resp = next.call(req).await;

                let backend = resp
                    .headers()
                    .get(PROXY_BACKEND_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                breaker.record(resp.status().as_u16(), backend.as_deref());
                resp
            }
        })
    }
}
