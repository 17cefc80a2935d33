use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub routes: Vec<Route>,
    #[serde(rename = "ratelimit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(rename = "circuitbreaker", default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(rename = "healthcheck", default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub adaptive_rate_limit: AdaptiveRateLimitConfig,
    #[serde(default)]
    pub weighted_lb: WeightedLbConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// A route mapping: URL path prefix to one or more backend servers.
/// `backend` (single) and `backends` (list) are both accepted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Route {
    pub path: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
}

impl Route {
    /// Backend URLs for this route, whichever config form was used.
    pub fn backend_urls(&self) -> Vec<String> {
        if !self.backends.is_empty() {
            return self.backends.clone();
        }
        self.backend.clone().into_iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

fn default_max_tokens() -> f64 {
    100.0
}

fn default_refill_rate() -> f64 {
    10.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate: default_refill_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_cb_threshold")]
    pub threshold: u32,
    #[serde(default = "default_cb_timeout")]
    pub timeout_seconds: u64,
}

fn default_cb_threshold() -> u32 {
    5
}

fn default_cb_timeout() -> u64 {
    30
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_cb_threshold(),
            timeout_seconds: default_cb_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_hc_interval")]
    pub interval_seconds: u64,
}

fn default_hc_interval() -> u64 {
    10
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_hc_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "duration_str", default = "default_bucket_interval")]
    pub bucket_interval: Duration,
    #[serde(with = "duration_str", default = "default_retention")]
    pub retention: Duration,
    #[serde(with = "duration_str", default = "default_analyzer_interval")]
    pub analyzer_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_bucket_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retention() -> Duration {
    Duration::from_secs(48 * 3600)
}

fn default_analyzer_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket_interval: default_bucket_interval(),
            retention: default_retention(),
            analyzer_interval: default_analyzer_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdaptiveRateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_min_limit")]
    pub min_limit: f64,
    #[serde(default = "default_max_limit")]
    pub max_limit: f64,
    #[serde(with = "duration_str", default = "default_learning_period")]
    pub learning_period: Duration,
}

fn default_multiplier() -> f64 {
    3.0
}

fn default_min_limit() -> f64 {
    10.0
}

fn default_max_limit() -> f64 {
    10_000.0
}

fn default_learning_period() -> Duration {
    Duration::from_secs(3600)
}

impl Default for AdaptiveRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            multiplier: default_multiplier(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            learning_period: default_learning_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightedLbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(with = "duration_str", default = "default_rebalance_interval")]
    pub rebalance_interval: Duration,
}

fn default_rebalance_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for WeightedLbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rebalance_interval: default_rebalance_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_sse_buffer")]
    pub sse_buffer: usize,
}

fn default_log_capacity() -> usize {
    1000
}

fn default_sse_buffer() -> usize {
    256
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_capacity: default_log_capacity(),
            sse_buffer: default_sse_buffer(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server port cannot be zero");
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if route.path.is_empty() || !route.path.starts_with('/') {
                anyhow::bail!("route path must start with '/': {:?}", route.path);
            }
            if !seen.insert(route.path.clone()) {
                anyhow::bail!("duplicate route prefix: {}", route.path);
            }
            if route.backend_urls().is_empty() {
                anyhow::bail!("route '{}' must have at least one backend", route.path);
            }
        }

        if self.rate_limit.max_tokens <= 0.0 || self.rate_limit.refill_rate <= 0.0 {
            anyhow::bail!("ratelimit max_tokens and refill_rate must be positive");
        }

        Ok(())
    }

    /// Union of all backend URLs across routes, order-preserving and deduplicated.
    pub fn all_backend_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for route in &self.routes {
            for url in route.backend_urls() {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }
        urls
    }
}

/// Serde adapter for human duration strings ("90s", "5m", "48h").
/// Bare numbers are treated as seconds.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (num, unit) = match s.chars().last() {
            Some('s') => (&s[..s.len() - 1], 1),
            Some('m') => (&s[..s.len() - 1], 60),
            Some('h') => (&s[..s.len() - 1], 3600),
            _ => (s, 1),
        };
        let n: u64 = num
            .parse()
            .map_err(|_| format!("invalid duration: {:?}", s))?;
        Ok(Duration::from_secs(n * unit))
    }
}
