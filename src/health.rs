#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cached health state for a single backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Callback invoked when a backend flips between healthy and unhealthy.
pub type StateChangeFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Probes backends on a timer and caches the results so that hot paths
/// (selectors, the /health endpoint) never wait on a probe.
pub struct HealthRegistry {
    backends: RwLock<HashMap<String, BackendStatus>>,
    started: Instant,
    client: Client,
    on_state_change: Mutex<Option<StateChangeFn>>,
}

impl HealthRegistry {
    /// Create a registry for the given backend URLs.
    /// Backends start out healthy until the first probe says otherwise.
    pub fn new(backend_urls: &[String]) -> Self {
        let backends = backend_urls
            .iter()
            .map(|url| {
                (
                    url.clone(),
                    BackendStatus {
                        url: url.clone(),
                        healthy: true,
                        last_check: None,
                    },
                )
            })
            .collect();

        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent("adaptive-gateway-healthcheck/1.0")
            .build()
            .unwrap_or_default();

        Self {
            backends: RwLock::new(backends),
            started: Instant::now(),
            client,
            on_state_change: Mutex::new(None),
        }
    }

    /// Register a hook fired (outside the registry lock) on every state flip.
    pub fn set_on_state_change(&self, f: StateChangeFn) {
        *self.on_state_change.lock().unwrap() = Some(f);
    }

    /// Probe one backend: 200 means healthy, anything else (including
    /// timeout) means unhealthy.
    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Apply a probe result. Returns the new state if it changed.
    pub(crate) fn apply(&self, url: &str, healthy: bool, now: DateTime<Utc>) -> Option<bool> {
        let mut backends = self.backends.write().unwrap();
        let status = backends.get_mut(url)?;
        let was = status.healthy;
        status.healthy = healthy;
        status.last_check = Some(now);
        (was != healthy).then_some(healthy)
    }

    /// One probe pass over every known backend.
    pub async fn run_checks(&self) {
        let urls: Vec<String> = {
            let backends = self.backends.read().unwrap();
            backends.keys().cloned().collect()
        };

        let mut changed = Vec::new();
        for url in urls {
            let healthy = self.probe(&url).await;
            if let Some(now_healthy) = self.apply(&url, healthy, Utc::now()) {
                changed.push((url.clone(), now_healthy));
            }
            if healthy {
                debug!(backend = %url, "health check passed");
            } else {
                warn!(backend = %url, "health check failed");
            }
        }

        // Callbacks fire after the write lock is released.
        if !changed.is_empty() {
            let hook = self.on_state_change.lock().unwrap().clone();
            if let Some(hook) = hook {
                for (url, healthy) in changed {
                    hook(&url, healthy);
                }
            }
        }
    }

    /// Launch the recurring probe task. An initial pass runs immediately.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.run_checks().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; already probed
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.run_checks().await,
                }
            }
            info!("health registry stopped");
        })
    }

    /// Register a backend discovered at runtime. It stays unhealthy until
    /// the next probe pass confirms it.
    pub fn add_backend(&self, url: &str) {
        let mut backends = self.backends.write().unwrap();
        backends.entry(url.to_string()).or_insert_with(|| BackendStatus {
            url: url.to_string(),
            healthy: false,
            last_check: None,
        });
    }

    pub fn is_healthy(&self, url: &str) -> bool {
        self.backends
            .read()
            .unwrap()
            .get(url)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    /// (healthy, total) backend counts.
    pub fn backend_counts(&self) -> (usize, usize) {
        let backends = self.backends.read().unwrap();
        let healthy = backends.values().filter(|s| s.healthy).count();
        (healthy, backends.len())
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Snapshot of all backend statuses.
    pub fn statuses(&self) -> HashMap<String, BackendStatus> {
        self.backends.read().unwrap().clone()
    }
}

/// `GET /health`: 200 when every backend is healthy, 503 otherwise.
pub async fn health_endpoint(State(registry): State<Arc<HealthRegistry>>) -> impl IntoResponse {
    let statuses = registry.statuses();
    let all_healthy = statuses.values().all(|s| s.healthy);
    let uptime = registry.uptime();

    let body = json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "uptime": format!("{}s", uptime.as_secs()),
        "backends": statuses,
    });

    let code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}
