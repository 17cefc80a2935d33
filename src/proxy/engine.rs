#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderName, HOST};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use super::{RouteTable, Selector, GATEWAY_HEADER, GATEWAY_ID, PROXY_BACKEND_HEADER};
use crate::error::GatewayError;
use crate::health::HealthRegistry;

/// The reverse-proxy core: longest-prefix route lookup, backend selection,
/// and transparent forwarding. Bodies stream through in both directions.
pub struct ProxyEngine {
    selectors: RwLock<HashMap<String, Arc<dyn Selector>>>,
    table: Arc<RouteTable>,
    health: Arc<HealthRegistry>,
    client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(table: Arc<RouteTable>, health: Arc<HealthRegistry>) -> Result<Self> {
        // No overall request timeout: the gateway imposes none beyond the
        // client's own, and the circuit breaker covers misbehaving backends.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent("adaptive-gateway/1.0")
            .build()?;

        Ok(Self {
            selectors: RwLock::new(HashMap::new()),
            table,
            health,
            client,
        })
    }

    /// Install the selector for a route prefix. Also used at startup to
    /// swap a round-robin selector for a weighted one.
    pub fn set_selector(&self, prefix: &str, selector: Arc<dyn Selector>) {
        self.selectors
            .write()
            .unwrap()
            .insert(prefix.to_string(), selector);
    }

    /// Register a new backend for a route at runtime: it joins the route's
    /// selector pool and the health registry (unhealthy until probed).
    pub fn add_backend(&self, prefix: &str, url: &str) -> Result<(), GatewayError> {
        let selector = self
            .selectors
            .read()
            .unwrap()
            .get(prefix)
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound(prefix.to_string()))?;
        selector.add_backend(url.to_string());
        self.health.add_backend(url);
        Ok(())
    }

    /// Proxy one request; failures become their HTTP responses here so this
    /// can serve as the pipeline's terminal handler.
    pub async fn handle(&self, req: Request) -> Response {
        match self.forward(req).await {
            Ok(resp) => resp,
            Err(err) => {
                if matches!(err, GatewayError::Internal(_) | GatewayError::Upstream(_)) {
                    error!(error = %err, "proxy error");
                }
                err.into_response()
            }
        }
    }

    async fn forward(&self, req: Request) -> Result<Response, GatewayError> {
        let path = req.uri().path().to_string();
        let prefix = self
            .table
            .match_path(&path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.clone()))?
            .to_string();

        let selector = self
            .selectors
            .read()
            .unwrap()
            .get(&prefix)
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound(prefix.clone()))?;

        let backend = selector
            .next()
            .ok_or_else(|| GatewayError::NoHealthyBackend(prefix.clone()))?;

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", backend.trim_end_matches('/'), path_and_query);
        let target_url = reqwest::Url::parse(&target)
            .map_err(|e| GatewayError::Internal(format!("bad backend URL {target:?}: {e}")))?;

        debug!(method = %req.method(), path = %path, backend = %backend, "proxying request");

        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string));

        let (parts, body) = req.into_parts();

        let mut outbound = self
            .client
            .request(parts.method.clone(), target_url)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name) && name != HOST {
                outbound = outbound.header(name, value);
            }
        }
        if let Some(host) = original_host {
            outbound = outbound.header("x-forwarded-host", host);
        }
        outbound = outbound.header(GATEWAY_HEADER, GATEWAY_ID);

        let upstream = outbound
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("{backend}: {e}")))?;

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers().iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(PROXY_BACKEND_HEADER, backend.as_str());

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("response build failed: {e}")))
    }
}

/// Hop-by-hop headers are connection-scoped and never forwarded.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::proxy::Balancer;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;

    fn engine_with(routes: &[(&str, Vec<String>)]) -> ProxyEngine {
        let prefixes: Vec<String> = routes.iter().map(|(p, _)| p.to_string()).collect();
        let table = Arc::new(RouteTable::new(&prefixes));
        let health = Arc::new(HealthRegistry::new(&[]));
        let engine = ProxyEngine::new(table, health).unwrap();
        for (prefix, backends) in routes {
            engine.set_selector(
                prefix,
                Arc::new(Balancer::new(backends.clone(), Strategy::RoundRobin, None)),
            );
        }
        engine
    }

    fn get_request(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unmatched_path_is_404() {
        let engine = engine_with(&[("/api", vec!["http://127.0.0.1:1".to_string()])]);
        let resp = engine.handle(get_request("/elsewhere")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_backend_pool_is_503() {
        let engine = engine_with(&[("/api", Vec::new())]);
        let resp = engine.handle(get_request("/api/x")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_backend_url_is_500() {
        let engine = engine_with(&[("/api", vec!["not a url".to_string()])]);
        let resp = engine.handle(get_request("/api/x")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unreachable_backend_is_502() {
        // Port 1 refuses connections.
        let engine = engine_with(&[("/api", vec!["http://127.0.0.1:1".to_string()])]);
        let resp = engine.handle(get_request("/api/x")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    async fn spawn_backend() -> String {
        let app = Router::new().route(
            "/api/ping",
            get(|req: Request| async move {
                let fwd = req
                    .headers()
                    .get("x-forwarded-host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let gw = req
                    .headers()
                    .get(GATEWAY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                ([("x-echo-fwd-host", fwd), ("x-echo-gateway", gw)], "{\"ok\":true}")
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn forwards_and_attributes_backend() {
        let backend = spawn_backend().await;
        let engine = engine_with(&[("/api", vec![backend.clone()])]);

        let req = Request::builder()
            .uri("/api/ping")
            .header(HOST, "gateway.example")
            .body(Body::empty())
            .unwrap();
        let resp = engine.handle(req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[PROXY_BACKEND_HEADER].to_str().unwrap(),
            backend
        );
        assert_eq!(resp.headers()["x-echo-fwd-host"], "gateway.example");
        assert_eq!(resp.headers()["x-echo-gateway"], GATEWAY_ID);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"ok\":true}");
    }
}
