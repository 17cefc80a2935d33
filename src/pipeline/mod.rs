pub mod adaptive;
pub mod auth;
pub mod breaker;
pub mod capture;
pub mod logging;
pub mod metrics;
pub mod observe;
pub mod rate_limit;
pub mod request_id;
pub mod traffic;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::response::Response;

/// A composed request handler. Cheap to clone; stages capture their state in
/// `Arc`s and wrap each other.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>);

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

impl Handler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Handler(Arc::new(move |req| Box::pin(f(req))))
    }

    pub fn call(&self, req: Request) -> HandlerFuture {
        (self.0)(req)
    }
}

/// One middleware stage. `wrap` receives the next handler and returns the
/// wrapping handler; composition runs the stage before (and its response
/// logic after) everything it wraps.
pub trait Stage: Send + Sync {
    fn wrap(&self, next: Handler) -> Handler;
}

/// Compose stages around a terminal handler.
/// `chain(h, [s1, s2, s3])` runs s1 → s2 → s3 → h on the request and
/// unwinds in reverse on the response.
pub fn chain(terminal: Handler, stages: Vec<Arc<dyn Stage>>) -> Handler {
    stages
        .into_iter()
        .rev()
        .fold(terminal, |handler, stage| stage.wrap(handler))
}

/// Client identity: the remote address with the port stripped.
/// Relies on the `ConnectInfo` extension installed by the server.
pub fn client_ip(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
