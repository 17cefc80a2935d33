#![allow(dead_code)]

pub mod balancer;
pub mod engine;
pub mod weighted;

pub use balancer::Balancer;
pub use engine::ProxyEngine;
pub use weighted::WeightedBalancer;

/// Response header naming the backend a request was proxied to. Later
/// pipeline stages use it to attribute the outcome.
pub const PROXY_BACKEND_HEADER: &str = "x-proxy-backend";

/// Outbound header identifying this gateway to backends.
pub const GATEWAY_HEADER: &str = "x-gateway";
pub const GATEWAY_ID: &str = "adaptive-gateway";

/// Chooses one backend from a route's pool on each request. Both the
/// round-robin/random balancer and the weighted balancer satisfy this, so
/// the proxy core can swap them at configuration time.
pub trait Selector: Send + Sync {
    /// Next backend URL, or `None` when the pool is empty.
    fn next(&self) -> Option<String>;
    /// Register a backend at runtime.
    fn add_backend(&self, url: String);
}

/// Longest-prefix route matcher shared by the proxy core, the traffic
/// recorder, and the adaptive rate limiter. Prefixes are held sorted
/// longest-first, so matching is deterministic regardless of the order
/// routes were declared in.
pub struct RouteTable {
    prefixes: Vec<String>,
}

impl RouteTable {
    pub fn new(prefixes: &[String]) -> Self {
        let mut prefixes = prefixes.to_vec();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { prefixes }
    }

    /// The longest configured prefix matching `path`, if any. A prefix
    /// matches its exact path or any path below it.
    pub fn match_path(&self, path: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|prefix| {
                path == prefix.as_str()
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(String::as_str)
    }

    /// Normalized route for a path: the matched prefix, or the raw path
    /// when nothing matches (so unrouted traffic still aggregates).
    pub fn normalize(&self, path: &str) -> String {
        self.match_path(path).unwrap_or(path).to_string()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(prefixes: &[&str]) -> RouteTable {
        RouteTable::new(&prefixes.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table(&["/api", "/api/v1"]);
        assert_eq!(t.match_path("/api/v1/users"), Some("/api/v1"));
        assert_eq!(t.match_path("/api/v2/users"), Some("/api"));
        assert_eq!(t.match_path("/api"), Some("/api"));
    }

    #[test]
    fn matching_is_independent_of_declaration_order() {
        let forward = table(&["/api", "/api/v1"]);
        let reverse = table(&["/api/v1", "/api"]);
        for path in ["/api/v1/x", "/api/x", "/api", "/other"] {
            assert_eq!(forward.match_path(path), reverse.match_path(path));
        }
    }

    #[test]
    fn prefix_must_align_on_segment_boundary() {
        let t = table(&["/api"]);
        assert_eq!(t.match_path("/api/users"), Some("/api"));
        // "/apiary" shares the characters but not the segment.
        assert_eq!(t.match_path("/apiary"), None);
    }

    #[test]
    fn unmatched_path_normalizes_to_itself() {
        let t = table(&["/api"]);
        assert_eq!(t.normalize("/metrics-ish"), "/metrics-ish");
        assert_eq!(t.normalize("/api/v1"), "/api");
    }
}
