use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::store::TrafficStore;

/// A detected traffic anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub route: String,
    /// "request_rate", "error_rate", or "latency".
    pub metric: &'static str,
    pub current: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Baseline statistics for a single route over the analysis window.
#[derive(Debug, Clone, Serialize)]
pub struct RouteBaseline {
    pub route: String,
    /// Average requests per bucket window.
    pub mean_rate: f64,
    pub std_dev_rate: f64,
    pub mean_error_rate: f64,
    pub std_dev_error: f64,
    pub mean_latency_ms: f64,
    pub std_dev_latency: f64,
    pub p99_latency_ms: f64,
    /// Number of buckets the baseline was computed from.
    pub sample_size: usize,
}

/// Baseline statistics for a single backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendBaseline {
    pub backend: String,
    pub mean_latency_ms: f64,
    pub mean_error_rate: f64,
    pub std_dev_error: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// How often baselines are recomputed.
    pub interval: Duration,
    /// How far back each computation looks.
    pub window: Duration,
    pub z_score_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            window: Duration::from_secs(3600),
            z_score_threshold: 3.0,
        }
    }
}

/// Periodically reads the traffic store, computes per-route and per-backend
/// baselines, and flags z-score anomalies. Baselines are replaced as whole
/// snapshots under the write lock, so readers never observe a torn mix.
pub struct Analyzer {
    store: Arc<TrafficStore>,
    config: AnalyzerConfig,
    started: Instant,
    route_baselines: RwLock<HashMap<String, RouteBaseline>>,
    backend_baselines: RwLock<HashMap<String, BackendBaseline>>,
    anomalies: RwLock<Vec<Anomaly>>,
    anomaly_tx: broadcast::Sender<Anomaly>,
}

impl Analyzer {
    pub fn new(store: Arc<TrafficStore>, config: AnalyzerConfig) -> Self {
        let (anomaly_tx, _) = broadcast::channel(64);
        Self {
            store,
            config,
            started: Instant::now(),
            route_baselines: RwLock::new(HashMap::new()),
            backend_baselines: RwLock::new(HashMap::new()),
            anomalies: RwLock::new(Vec::new()),
            anomaly_tx,
        }
    }

    /// True once the analyzer has been alive for at least one full window.
    /// Consumers use this as the learning-period gate.
    pub fn has_sufficient_data(&self) -> bool {
        self.started.elapsed() >= self.config.window
    }

    /// Wall time since the analyzer was created.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Subscribe to the advisory anomaly feed. Slow consumers lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<Anomaly> {
        self.anomaly_tx.subscribe()
    }

    pub fn route_baseline(&self, route: &str) -> Option<RouteBaseline> {
        self.route_baselines.read().unwrap().get(route).cloned()
    }

    pub fn all_route_baselines(&self) -> HashMap<String, RouteBaseline> {
        self.route_baselines.read().unwrap().clone()
    }

    pub fn backend_baseline(&self, backend: &str) -> Option<BackendBaseline> {
        self.backend_baselines.read().unwrap().get(backend).cloned()
    }

    pub fn all_backend_baselines(&self) -> HashMap<String, BackendBaseline> {
        self.backend_baselines.read().unwrap().clone()
    }

    /// Anomalies from the last 24 hours, insertion (timestamp) order.
    pub fn recent_anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.read().unwrap().clone()
    }

    /// One analysis tick at an explicit instant, looking back one window.
    pub fn analyze_at(&self, now: DateTime<Utc>) {
        let from = now - chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::hours(1));
        self.analyze_window(from, now);
    }

    /// One analysis pass over an explicit [from, to) window.
    pub fn analyze_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) {
        self.analyze_routes(from, to);
        self.analyze_backends(from, to);
        self.prune_anomalies(to);
    }

    /// Launch the periodic analysis task. The first tick runs immediately.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let analyzer = self.clone();
        tokio::spawn(async move {
            analyzer.analyze_at(Utc::now());
            let mut ticker = tokio::time::interval(analyzer.config.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => analyzer.analyze_at(Utc::now()),
                }
            }
            info!("analyzer stopped");
        })
    }

    fn analyze_routes(&self, from: DateTime<Utc>, to: DateTime<Utc>) {
        let all_buckets = self.store.all_route_buckets(from, to);

        for (route, buckets) in all_buckets {
            if buckets.len() < 2 {
                continue;
            }

            let rates: Vec<f64> = buckets.iter().map(|b| b.request_count as f64).collect();
            let error_rates: Vec<f64> = buckets.iter().map(|b| b.error_rate()).collect();
            let latencies: Vec<f64> = buckets
                .iter()
                .map(|b| b.avg_latency().as_secs_f64() * 1000.0)
                .collect();

            let baseline = RouteBaseline {
                route: route.clone(),
                mean_rate: stats::mean(&rates),
                std_dev_rate: stats::std_dev(&rates),
                mean_error_rate: stats::mean(&error_rates),
                std_dev_error: stats::std_dev(&error_rates),
                mean_latency_ms: stats::mean(&latencies),
                std_dev_latency: stats::std_dev(&latencies),
                p99_latency_ms: stats::percentile(&latencies, 0.99),
                sample_size: buckets.len(),
            };

            // The most recent in-window bucket is the one checked for anomalies.
            let Some(current) = buckets.last() else {
                continue;
            };
            let checks = [
                ("request_rate", current.request_count as f64, baseline.mean_rate, baseline.std_dev_rate),
                ("error_rate", current.error_rate(), baseline.mean_error_rate, baseline.std_dev_error),
                (
                    "latency",
                    current.avg_latency().as_secs_f64() * 1000.0,
                    baseline.mean_latency_ms,
                    baseline.std_dev_latency,
                ),
            ];

            self.route_baselines
                .write()
                .unwrap()
                .insert(route.clone(), baseline);

            for (metric, current, mean, std_dev) in checks {
                self.check_anomaly(&route, metric, current, mean, std_dev, to);
            }
        }
    }

    fn analyze_backends(&self, from: DateTime<Utc>, to: DateTime<Utc>) {
        let all_buckets = self.store.backend_buckets(from, to);

        for (backend, buckets) in all_buckets {
            if buckets.len() < 2 {
                continue;
            }

            let error_rates: Vec<f64> = buckets.iter().map(|b| b.error_rate()).collect();
            let latencies: Vec<f64> = buckets
                .iter()
                .map(|b| b.avg_latency().as_secs_f64() * 1000.0)
                .collect();

            let baseline = BackendBaseline {
                backend: backend.clone(),
                mean_latency_ms: stats::mean(&latencies),
                mean_error_rate: stats::mean(&error_rates),
                std_dev_error: stats::std_dev(&error_rates),
                sample_size: buckets.len(),
            };

            self.backend_baselines.write().unwrap().insert(backend, baseline);
        }
    }

    fn check_anomaly(
        &self,
        route: &str,
        metric: &'static str,
        current: f64,
        mean: f64,
        std_dev: f64,
        now: DateTime<Utc>,
    ) {
        if std_dev == 0.0 || mean == 0.0 {
            return;
        }

        let z_score = (current - mean) / std_dev;
        if z_score <= self.config.z_score_threshold {
            return;
        }

        let anomaly = Anomaly {
            route: route.to_string(),
            metric,
            current,
            mean,
            std_dev,
            z_score,
            timestamp: now,
        };

        warn!(
            route,
            metric,
            current,
            mean,
            z_score,
            "traffic anomaly detected"
        );
        counter!("gateway_anomalies_total", "route" => route.to_string(), "metric" => metric)
            .increment(1);

        self.anomalies.write().unwrap().push(anomaly.clone());

        // Advisory broadcast; with no subscribers (or slow ones) the event
        // is simply lost.
        let _ = self.anomaly_tx.send(anomaly);
    }

    fn prune_anomalies(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::hours(24);
        self.anomalies
            .write()
            .unwrap()
            .retain(|a| a.timestamp >= cutoff);
    }
}

/// Statistical helpers shared by the analyzer.
pub mod stats {
    /// Arithmetic mean; 0 for an empty slice.
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Population standard deviation; 0 below two samples.
    pub fn std_dev(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let m = mean(values);
        let sum_squares: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
        (sum_squares / values.len() as f64).sqrt()
    }

    /// p-th percentile (nearest-rank): sorted[ceil(p·n) − 1], clamped.
    pub fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let idx = ((p * sorted.len() as f64).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::store::TrafficEvent;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_with_minutes(route: &str, per_minute: &[(u64, u64, u64)]) -> Arc<TrafficStore> {
        // (requests, errors, latency_ms) per one-minute bucket
        let store = Arc::new(TrafficStore::new(
            Duration::from_secs(60),
            Duration::from_secs(48 * 3600),
        ));
        for (minute, (requests, errors, latency_ms)) in per_minute.iter().enumerate() {
            for i in 0..*requests {
                let status = if i < *errors { 500 } else { 200 };
                store.record(&TrafficEvent {
                    route: route.to_string(),
                    backend: Some("http://b1".to_string()),
                    status,
                    latency: Duration::from_millis(*latency_ms),
                    bytes_in: 0,
                    bytes_out: 0,
                    client_ip: "10.0.0.1".to_string(),
                    timestamp: ts(minute as i64 * 60),
                });
            }
        }
        store
    }

    fn analyzer(store: Arc<TrafficStore>) -> Analyzer {
        Analyzer::new(store, AnalyzerConfig::default())
    }

    #[test]
    fn stats_helpers() {
        assert_eq!(stats::mean(&[]), 0.0);
        assert_eq!(stats::mean(&[2.0, 4.0]), 3.0);
        assert_eq!(stats::std_dev(&[5.0]), 0.0);
        // Population stddev of {2, 4, 4, 4, 5, 5, 7, 9} is exactly 2.
        let vals = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((stats::std_dev(&vals) - 2.0).abs() < 1e-12);
        assert_eq!(stats::percentile(&[], 0.99), 0.0);
        assert_eq!(stats::percentile(&[10.0], 0.99), 10.0);
        let hundred: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(stats::percentile(&hundred, 0.99), 99.0);
        assert_eq!(stats::percentile(&hundred, 0.5), 50.0);
    }

    #[test]
    fn computes_route_baseline() {
        let store = store_with_minutes("/api", &[(10, 0, 20), (20, 2, 40), (30, 0, 60)]);
        let a = analyzer(store);
        a.analyze_at(ts(3 * 60));

        let b = a.route_baseline("/api").unwrap();
        assert_eq!(b.sample_size, 3);
        assert!((b.mean_rate - 20.0).abs() < 1e-9);
        assert!((b.mean_latency_ms - 40.0).abs() < 1e-9);
        assert!((b.p99_latency_ms - 60.0).abs() < 1e-9);
        // error rates: 0, 0.1, 0 -> mean 1/30
        assert!((b.mean_error_rate - 0.1 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn computes_backend_baseline() {
        let store = store_with_minutes("/api", &[(10, 1, 20), (10, 1, 40)]);
        let a = analyzer(store);
        a.analyze_at(ts(2 * 60));

        let b = a.backend_baseline("http://b1").unwrap();
        assert_eq!(b.sample_size, 2);
        assert!((b.mean_latency_ms - 30.0).abs() < 1e-9);
        assert!((b.mean_error_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn skips_routes_with_fewer_than_two_buckets() {
        let store = store_with_minutes("/api", &[(10, 0, 20)]);
        let a = analyzer(store);
        a.analyze_at(ts(60));
        assert!(a.route_baseline("/api").is_none());
        assert!(a.recent_anomalies().is_empty());
    }

    #[test]
    fn flags_request_rate_spike() {
        // Steady 100 req/min, then a 500 req/min bucket at the end.
        let mut minutes = vec![(100u64, 0u64, 10u64); 10];
        minutes.push((500, 0, 10));
        let store = store_with_minutes("/api", &minutes);
        let a = analyzer(store);
        let mut rx = a.subscribe();

        a.analyze_at(ts(11 * 60));

        let anomalies = a.recent_anomalies();
        assert!(anomalies.iter().any(|an| an.metric == "request_rate"));
        let spike = anomalies.iter().find(|an| an.metric == "request_rate").unwrap();
        assert!(spike.z_score > 3.0);
        assert_eq!(spike.route, "/api");

        // Published on the broadcast feed too.
        let published = rx.try_recv().unwrap();
        assert_eq!(published.route, "/api");
    }

    #[test]
    fn zero_stddev_never_flags() {
        // Identical buckets: stddev = 0, guard must skip.
        let store = store_with_minutes("/api", &[(10, 0, 20); 5]);
        let a = analyzer(store);
        a.analyze_at(ts(5 * 60));
        assert!(a.recent_anomalies().is_empty());
    }

    #[test]
    fn anomalies_expire_after_24h() {
        let mut minutes = vec![(100u64, 0u64, 10u64); 10];
        minutes.push((500, 0, 10));
        let store = store_with_minutes("/api", &minutes);
        let a = analyzer(store);

        a.analyze_at(ts(11 * 60));
        assert!(!a.recent_anomalies().is_empty());

        a.prune_anomalies(ts(11 * 60 + 25 * 3600));
        assert!(a.recent_anomalies().is_empty());
    }

    #[test]
    fn learning_gate_follows_window() {
        let store = store_with_minutes("/api", &[]);
        let a = Analyzer::new(
            store,
            AnalyzerConfig {
                window: Duration::from_secs(3600),
                ..AnalyzerConfig::default()
            },
        );
        assert!(!a.has_sufficient_data());

        let b = Analyzer::new(
            Arc::new(TrafficStore::new(Duration::from_secs(60), Duration::from_secs(60))),
            AnalyzerConfig {
                window: Duration::ZERO,
                ..AnalyzerConfig::default()
            },
        );
        assert!(b.has_sufficient_data());
    }
}
