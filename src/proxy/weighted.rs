use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::gauge;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Selector;
use crate::analytics::Analyzer;
use crate::health::HealthRegistry;

/// A backend's normalized share of traffic.
#[derive(Debug, Clone)]
struct BackendWeight {
    url: String,
    weight: f64,
}

/// Distributes traffic proportionally to backend performance: lower latency
/// and fewer errors earn a larger share. Weights are recomputed from
/// analyzer baselines on a timer and replaced as a whole snapshot.
pub struct WeightedBalancer {
    backends: RwLock<Vec<String>>,
    weights: RwLock<Vec<BackendWeight>>,
    analyzer: Arc<Analyzer>,
    health: Option<Arc<HealthRegistry>>,
    rebalance_interval: Duration,
}

/// Backends below this sample count keep the uniform placeholder weight.
const MIN_SAMPLE_SIZE: usize = 2;

impl WeightedBalancer {
    pub fn new(
        backends: Vec<String>,
        analyzer: Arc<Analyzer>,
        health: Option<Arc<HealthRegistry>>,
        rebalance_interval: Duration,
    ) -> Self {
        let uniform = if backends.is_empty() {
            Vec::new()
        } else {
            let w = 1.0 / backends.len() as f64;
            backends
                .iter()
                .map(|url| BackendWeight {
                    url: url.clone(),
                    weight: w,
                })
                .collect()
        };

        Self {
            backends: RwLock::new(backends),
            weights: RwLock::new(uniform),
            analyzer,
            health,
            rebalance_interval,
        }
    }

    /// Recompute weights from the current baselines and publish the new
    /// snapshot. Backends without enough samples weigh in as 1.0 raw
    /// (uniform) until data accrues.
    pub fn rebalance(&self) {
        let backends = self.backends.read().unwrap().clone();
        if backends.is_empty() {
            return;
        }

        let mut new_weights: Vec<BackendWeight> = backends
            .iter()
            .map(|url| {
                let raw = match self.analyzer.backend_baseline(url) {
                    Some(b) if b.sample_size >= MIN_SAMPLE_SIZE => {
                        compute_weight(b.mean_latency_ms, b.mean_error_rate)
                    }
                    _ => 1.0,
                };
                BackendWeight {
                    url: url.clone(),
                    weight: raw,
                }
            })
            .collect();

        let total: f64 = new_weights.iter().map(|w| w.weight).sum();
        if total > 0.0 {
            for w in &mut new_weights {
                w.weight /= total;
            }
        }

        for w in &new_weights {
            info!(backend = %w.url, weight = w.weight, "backend weight updated");
            gauge!("gateway_backend_weight", "backend" => w.url.clone()).set(w.weight);
        }

        *self.weights.write().unwrap() = new_weights;
    }

    /// Launch the periodic rebalance task, with one immediate rebalance.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let balancer = self.clone();
        tokio::spawn(async move {
            balancer.rebalance();
            let mut ticker = tokio::time::interval(balancer.rebalance_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => balancer.rebalance(),
                }
            }
        })
    }

    /// Current weight per backend (for the analytics API).
    pub fn weights(&self) -> HashMap<String, f64> {
        self.weights
            .read()
            .unwrap()
            .iter()
            .map(|w| (w.url.clone(), w.weight))
            .collect()
    }
}

/// Weight formula: inverse latency times reliability, both floored so one
/// terrible metric cannot zero a backend out entirely.
fn compute_weight(avg_latency_ms: f64, error_rate: f64) -> f64 {
    let latency_score = 1.0 / avg_latency_ms.max(1.0);
    let reliability_score = (1.0 - error_rate).max(0.01);
    latency_score * reliability_score
}

impl Selector for WeightedBalancer {
    fn next(&self) -> Option<String> {
        let weights = self.weights.read().unwrap().clone();

        // Healthy subset first; the full snapshot when that comes up empty.
        let healthy: Vec<BackendWeight> = match &self.health {
            Some(health) => {
                let filtered: Vec<BackendWeight> = weights
                    .iter()
                    .filter(|w| health.is_healthy(&w.url))
                    .cloned()
                    .collect();
                if filtered.is_empty() {
                    if !weights.is_empty() {
                        warn!("no healthy backends, falling back to full pool");
                    }
                    weights
                } else {
                    filtered
                }
            }
            None => weights,
        };

        if healthy.is_empty() {
            return None;
        }

        let total: f64 = healthy.iter().map(|w| w.weight).sum();
        let roll = rand::thread_rng().gen::<f64>() * total;
        let mut cumulative = 0.0;
        for w in &healthy {
            cumulative += w.weight;
            if roll <= cumulative {
                return Some(w.url.clone());
            }
        }
        // Rounding edge: the roll landed past the last cumulative step.
        healthy.last().map(|w| w.url.clone())
    }

    fn add_backend(&self, url: String) {
        let mut backends = self.backends.write().unwrap();
        backends.push(url.clone());
        let placeholder = 1.0 / backends.len() as f64;
        self.weights.write().unwrap().push(BackendWeight {
            url,
            weight: placeholder,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{AnalyzerConfig, TrafficEvent, TrafficStore};
    use chrono::{TimeZone, Utc};

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Analyzer with fixed per-backend profiles: (url, latency_ms, errors_per_100).
    fn analyzer_with(profiles: &[(&str, u64, u64)]) -> Arc<Analyzer> {
        let store = Arc::new(TrafficStore::new(
            Duration::from_secs(60),
            Duration::from_secs(48 * 3600),
        ));
        for minute in 0..5i64 {
            for (url, latency_ms, errors) in profiles {
                for i in 0..100u64 {
                    store.record(&TrafficEvent {
                        route: "/api".to_string(),
                        backend: Some(url.to_string()),
                        status: if i < *errors { 500 } else { 200 },
                        latency: Duration::from_millis(*latency_ms),
                        bytes_in: 0,
                        bytes_out: 0,
                        client_ip: "10.0.0.1".to_string(),
                        timestamp: Utc.timestamp_opt(minute * 60, 0).unwrap(),
                    });
                }
            }
        }
        let analyzer = Arc::new(Analyzer::new(store, AnalyzerConfig::default()));
        analyzer.analyze_window(
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(300, 0).unwrap(),
        );
        analyzer
    }

    #[test]
    fn starts_with_uniform_weights() {
        let analyzer = analyzer_with(&[]);
        let lb = WeightedBalancer::new(urls(&["a", "b", "c", "d"]), analyzer, None, Duration::from_secs(300));
        for w in lb.weights().values() {
            assert!((w - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn weights_normalize_to_one() {
        let analyzer = analyzer_with(&[("a", 20, 0), ("b", 200, 1)]);
        let lb = WeightedBalancer::new(urls(&["a", "b"]), analyzer, None, Duration::from_secs(300));
        lb.rebalance();
        let total: f64 = lb.weights().values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn faster_cleaner_backend_gets_more_weight() {
        // a: 20ms, 0.1% errors; b: 200ms, 1% errors.
        // raw(a)/raw(b) = (1/20 * 0.999) / (1/200 * 0.99) ≈ 10.09
        let analyzer = analyzer_with(&[("a", 20, 0), ("b", 200, 1)]);
        let lb = WeightedBalancer::new(urls(&["a", "b"]), analyzer, None, Duration::from_secs(300));
        lb.rebalance();

        let weights = lb.weights();
        let ratio = weights["a"] / weights["b"];
        assert!(ratio > 9.0 && ratio < 11.0, "ratio = {ratio}");
    }

    #[test]
    fn rebalance_is_deterministic_for_unchanged_baselines() {
        let analyzer = analyzer_with(&[("a", 20, 0), ("b", 200, 1)]);
        let lb = WeightedBalancer::new(urls(&["a", "b"]), analyzer, None, Duration::from_secs(300));
        lb.rebalance();
        let first = lb.weights();
        lb.rebalance();
        let second = lb.weights();
        assert_eq!(first, second);
    }

    #[test]
    fn selection_tracks_weights_statistically() {
        let analyzer = analyzer_with(&[("a", 20, 0), ("b", 200, 1)]);
        let lb = WeightedBalancer::new(urls(&["a", "b"]), analyzer, None, Duration::from_secs(300));
        lb.rebalance();

        let n = 5000;
        let mut picked_a = 0;
        for _ in 0..n {
            if lb.next().unwrap() == "a" {
                picked_a += 1;
            }
        }
        let share = picked_a as f64 / n as f64;
        // Expected share ≈ 0.91; allow generous slack for randomness.
        assert!(share > 0.85 && share < 0.97, "share = {share}");
    }

    #[test]
    fn sparse_backends_keep_placeholder_weight() {
        // Only "a" has baselines; "b" never served traffic.
        let analyzer = analyzer_with(&[("a", 20, 0)]);
        let lb = WeightedBalancer::new(urls(&["a", "b"]), analyzer, None, Duration::from_secs(300));
        lb.rebalance();

        let weights = lb.weights();
        // raw(a) = 1/20·0.999 ≈ 0.05, raw(b) = 1.0 -> b dominates until it
        // has real samples.
        assert!(weights["b"] > weights["a"]);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unhealthy_backend_is_not_selected() {
        let analyzer = analyzer_with(&[("a", 20, 0), ("b", 20, 0)]);
        let health = Arc::new(HealthRegistry::new(&urls(&["a", "b"])));
        health.apply("b", false, Utc::now());

        let lb = WeightedBalancer::new(
            urls(&["a", "b"]),
            analyzer,
            Some(health),
            Duration::from_secs(300),
        );
        lb.rebalance();
        for _ in 0..50 {
            assert_eq!(lb.next().unwrap(), "a");
        }
    }

    #[test]
    fn empty_pool_yields_none() {
        let analyzer = analyzer_with(&[]);
        let lb = WeightedBalancer::new(Vec::new(), analyzer, None, Duration::from_secs(300));
        assert_eq!(lb.next(), None);
        lb.rebalance();
        assert_eq!(lb.next(), None);
    }

    #[test]
    fn added_backend_gets_placeholder_weight() {
        let analyzer = analyzer_with(&[]);
        let lb = WeightedBalancer::new(urls(&["a"]), analyzer, None, Duration::from_secs(300));
        lb.add_backend("b".to_string());
        assert!(lb.weights().contains_key("b"));
        let picks: Vec<String> = (0..100).map(|_| lb.next().unwrap()).collect();
        assert!(picks.contains(&"b".to_string()));
    }
}
