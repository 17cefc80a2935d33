#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A single request data point captured by the traffic recorder.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    /// Normalized route prefix (e.g. "/api/v1").
    pub route: String,
    /// Backend that handled the request, when known.
    pub backend: Option<String>,
    pub status: u16,
    pub latency: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub client_ip: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated traffic for one route (or backend) during one bucket window.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub key: String,
    /// Start of the bucket window.
    pub timestamp: DateTime<Utc>,
    pub request_count: u64,
    /// Requests with status >= 500.
    pub error_count: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Bucket {
    fn new(key: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            timestamp,
            request_count: 0,
            error_count: 0,
            total_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    fn absorb(&mut self, event: &TrafficEvent) {
        self.request_count += 1;
        self.total_latency += event.latency;
        if event.latency > self.max_latency {
            self.max_latency = event.latency;
        }
        if event.status >= 500 {
            self.error_count += 1;
        }
        self.bytes_in += event.bytes_in;
        self.bytes_out += event.bytes_out;
    }

    /// Mean latency across the bucket.
    pub fn avg_latency(&self) -> Duration {
        if self.request_count == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.request_count as u32
    }

    /// Fraction of requests that were 5xx.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64
    }
}

type BucketMap = HashMap<String, BTreeMap<DateTime<Utc>, Bucket>>;

#[derive(Default)]
struct Maps {
    routes: BucketMap,
    backends: BucketMap,
}

/// Thread-safe, in-memory, time-bucketed aggregate of per-route and
/// per-backend traffic. A single reader/writer lock guards both maps;
/// the traffic recorder's drain task is the only sustained writer, so the
/// lock is held only briefly per event.
pub struct TrafficStore {
    inner: RwLock<Maps>,
    bucket_interval: Duration,
    retention: Duration,
}

impl TrafficStore {
    pub fn new(bucket_interval: Duration, retention: Duration) -> Self {
        let bucket_interval = if bucket_interval.is_zero() {
            Duration::from_secs(60)
        } else {
            bucket_interval
        };
        let retention = if retention.is_zero() {
            Duration::from_secs(48 * 3600)
        } else {
            retention
        };
        Self {
            inner: RwLock::new(Maps::default()),
            bucket_interval,
            retention,
        }
    }

    fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.bucket_interval.as_secs() as i64;
        let rem = ts.timestamp().rem_euclid(step);
        let nanos = ts.timestamp_subsec_nanos();
        ts - chrono::Duration::seconds(rem) - chrono::Duration::nanoseconds(nanos as i64)
    }

    /// Fold one event into its route bucket, and its backend bucket when a
    /// backend is attributed.
    pub fn record(&self, event: &TrafficEvent) {
        let window = self.truncate(event.timestamp);
        let mut maps = self.inner.write().unwrap();

        record_into(&mut maps.routes, &event.route, window, event);
        if let Some(backend) = event.backend.as_deref().filter(|b| !b.is_empty()) {
            record_into(&mut maps.backends, backend, window, event);
        }
    }

    /// Buckets for one route within [from, to), ascending by timestamp.
    /// Returned buckets are copies; callers never alias internal state.
    pub fn route_buckets(
        &self,
        route: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Bucket> {
        let maps = self.inner.read().unwrap();
        collect(maps.routes.get(route), from, to)
    }

    /// Buckets for every route with data within [from, to).
    pub fn all_route_buckets(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> HashMap<String, Vec<Bucket>> {
        let maps = self.inner.read().unwrap();
        collect_all(&maps.routes, from, to)
    }

    /// Buckets for every backend with data within [from, to).
    pub fn backend_buckets(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> HashMap<String, Vec<Bucket>> {
        let maps = self.inner.read().unwrap();
        collect_all(&maps.backends, from, to)
    }

    /// All known route names, sorted.
    pub fn routes(&self) -> Vec<String> {
        let maps = self.inner.read().unwrap();
        let mut routes: Vec<String> = maps.routes.keys().cloned().collect();
        routes.sort();
        routes
    }

    /// Drop every bucket older than the retention horizon, measured from `now`.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(48));
        let mut maps = self.inner.write().unwrap();
        prune(&mut maps.routes, cutoff);
        prune(&mut maps.backends, cutoff);
        debug!(routes = maps.routes.len(), backends = maps.backends.len(), "retention sweep done");
    }

    /// Launch the retention sweeper (every 10 minutes).
    pub fn spawn_retention(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10 * 60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => store.sweep(Utc::now()),
                }
            }
            info!("traffic store retention sweeper stopped");
        })
    }
}

fn record_into(map: &mut BucketMap, key: &str, window: DateTime<Utc>, event: &TrafficEvent) {
    map.entry(key.to_string())
        .or_default()
        .entry(window)
        .or_insert_with(|| Bucket::new(key.to_string(), window))
        .absorb(event);
}

fn collect(
    buckets: Option<&BTreeMap<DateTime<Utc>, Bucket>>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<Bucket> {
    let Some(buckets) = buckets else {
        return Vec::new();
    };
    if from >= to {
        return Vec::new();
    }
    buckets.range(from..to).map(|(_, b)| b.clone()).collect()
}

fn collect_all(map: &BucketMap, from: DateTime<Utc>, to: DateTime<Utc>) -> HashMap<String, Vec<Bucket>> {
    map.iter()
        .filter_map(|(key, buckets)| {
            let collected = collect(Some(buckets), from, to);
            (!collected.is_empty()).then(|| (key.clone(), collected))
        })
        .collect()
}

fn prune(map: &mut BucketMap, cutoff: DateTime<Utc>) {
    for buckets in map.values_mut() {
        buckets.retain(|ts, _| *ts >= cutoff);
    }
    map.retain(|_, buckets| !buckets.is_empty());
}
