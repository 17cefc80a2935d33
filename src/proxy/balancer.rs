use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use tracing::warn;

use super::Selector;
use crate::config::Strategy;
use crate::health::HealthRegistry;

/// Round-robin or random backend selector that skips backends the health
/// registry marks unhealthy. When every backend is unhealthy the full pool
/// is used anyway; a cascading rejection by the circuit breaker beats
/// serving nothing at all.
pub struct Balancer {
    backends: RwLock<Vec<String>>,
    strategy: Strategy,
    counter: AtomicU64,
    health: Option<Arc<HealthRegistry>>,
}

impl Balancer {
    pub fn new(backends: Vec<String>, strategy: Strategy, health: Option<Arc<HealthRegistry>>) -> Self {
        Self {
            backends: RwLock::new(backends),
            strategy,
            counter: AtomicU64::new(0),
            health,
        }
    }

    /// Snapshot of the currently-usable pool: the healthy subset, or the
    /// full list when the filter would leave nothing.
    fn usable_backends(&self) -> Vec<String> {
        let all = self.backends.read().unwrap().clone();
        let Some(health) = &self.health else {
            return all;
        };

        let healthy: Vec<String> = all
            .iter()
            .filter(|url| health.is_healthy(url))
            .cloned()
            .collect();
        if healthy.is_empty() {
            if !all.is_empty() {
                warn!("no healthy backends, falling back to full pool");
            }
            return all;
        }
        healthy
    }
}

impl Selector for Balancer {
    fn next(&self) -> Option<String> {
        let pool = self.usable_backends();
        if pool.is_empty() {
            return None;
        }
        let idx = match self.strategy {
            Strategy::Random => rand::thread_rng().gen_range(0..pool.len()),
            Strategy::RoundRobin => {
                (self.counter.fetch_add(1, Ordering::Relaxed) % pool.len() as u64) as usize
            }
        };
        Some(pool[idx].clone())
    }

    fn add_backend(&self, url: String) {
        self.backends.write().unwrap().push(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let lb = Balancer::new(urls(&["a", "b", "c"]), Strategy::RoundRobin, None);
        let picks: Vec<String> = (0..6).map(|_| lb.next().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn empty_pool_yields_none() {
        let lb = Balancer::new(Vec::new(), Strategy::RoundRobin, None);
        assert_eq!(lb.next(), None);
        let lb = Balancer::new(Vec::new(), Strategy::Random, None);
        assert_eq!(lb.next(), None);
    }

    #[test]
    fn random_only_picks_configured_backends() {
        let lb = Balancer::new(urls(&["a", "b"]), Strategy::Random, None);
        for _ in 0..50 {
            let pick = lb.next().unwrap();
            assert!(pick == "a" || pick == "b");
        }
    }

    #[test]
    fn unhealthy_backends_are_skipped() {
        let health = Arc::new(HealthRegistry::new(&urls(&["a", "b", "c"])));
        // Probe outcome: "b" goes down.
        health.apply("b", false, Utc::now());

        let lb = Balancer::new(urls(&["a", "b", "c"]), Strategy::RoundRobin, Some(health));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            *counts.entry(lb.next().unwrap()).or_default() += 1;
        }
        assert_eq!(counts.get("b"), None);
        assert_eq!(counts["a"], 50);
        assert_eq!(counts["c"], 50);
    }

    #[test]
    fn all_unhealthy_falls_back_to_full_pool() {
        let health = Arc::new(HealthRegistry::new(&urls(&["a", "b"])));
        health.apply("a", false, Utc::now());
        health.apply("b", false, Utc::now());

        let lb = Balancer::new(urls(&["a", "b"]), Strategy::RoundRobin, Some(health));
        assert!(lb.next().is_some());
    }

    #[test]
    fn added_backend_joins_rotation() {
        let lb = Balancer::new(urls(&["a"]), Strategy::RoundRobin, None);
        lb.add_backend("b".to_string());
        let picks: Vec<String> = (0..4).map(|_| lb.next().unwrap()).collect();
        assert!(picks.contains(&"b".to_string()));
    }
}
