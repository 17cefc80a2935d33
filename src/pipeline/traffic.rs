use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::observe::ObservedBody;
use super::{client_ip, Handler, Stage};
use crate::analytics::{TrafficEvent, TrafficStore};
use crate::proxy::{RouteTable, PROXY_BACKEND_HEADER};

const CHANNEL_CAPACITY: usize = 256;

/// Captures one [`TrafficEvent`] per completed request and hands it to a
/// bounded channel. A single drain task serializes writes into the traffic
/// store, which keeps the store's lock contention trivial and absorbs
/// bursts. When the channel is full the event is dropped; the response path
/// is never blocked for observability.
pub struct TrafficRecorder {
    events: mpsc::Sender<TrafficEvent>,
    routes: Arc<RouteTable>,
}

impl TrafficRecorder {
    /// Returns the recorder stage and the drain task feeding `store`.
    pub fn new(
        store: Arc<TrafficStore>,
        routes: Arc<RouteTable>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TrafficEvent>(CHANNEL_CAPACITY);

        let drain = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => store.record(&event),
                        None => break,
                    },
                }
            }
            info!("traffic recorder drain stopped");
        });

        (
            Self {
                events: tx,
                routes,
            },
            drain,
        )
    }
}

impl Stage for TrafficRecorder {
    fn wrap(&self, next: Handler) -> Handler {
        let events = self.events.clone();
        let routes = self.routes.clone();
        Handler::new(move |req| {
            let next = next.clone();
            let events = events.clone();
            let routes = routes.clone();
            async move {
                let start = Instant::now();
                let started_at = Utc::now();
                let route = routes.normalize(req.uri().path());
                let client = client_ip(&req);
                let bytes_in = req
                    .headers()
                    .get(axum::http::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);

                let resp = next.call(req).await;

                let status = resp.status().as_u16();
                let backend = resp
                    .headers()
                    .get(PROXY_BACKEND_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                // The event fires once the response body has fully streamed
                // (or the client went away), so latency and bytes_out cover
                // the whole exchange.
                ObservedBody::wrap(
                    resp,
                    Box::new(move |bytes_out| {
                        let event = TrafficEvent {
                            route,
                            backend,
                            status,
                            latency: start.elapsed(),
                            bytes_in,
                            bytes_out,
                            client_ip: client,
                            timestamp: started_at,
                        };
                        // Full channel: drop rather than block.
                        let _ = events.try_send(event);
                    }),
                )
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chain;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::response::Response;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn store() -> Arc<TrafficStore> {
        Arc::new(TrafficStore::new(
            Duration::from_secs(60),
            Duration::from_secs(48 * 3600),
        ))
    }

    fn table() -> Arc<RouteTable> {
        Arc::new(RouteTable::new(&["/api/v1".to_string()]))
    }

    fn backend_responder(status: u16, body: &'static str) -> Handler {
        Handler::new(move |_req| async move {
            Response::builder()
                .status(status)
                .header(PROXY_BACKEND_HEADER, "http://b1")
                .body(Body::from(body))
                .unwrap()
        })
    }

    async fn drive(handler: &Handler, path: &str) {
        let resp = handler
            .call(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await;
        // Consume the body so the completion hook fires.
        resp.into_body().collect().await.unwrap();
        // Let the drain task pick the event up.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn records_event_with_normalized_route_and_backend() {
        let store = store();
        let cancel = CancellationToken::new();
        let (recorder, _drain) = TrafficRecorder::new(store.clone(), table(), cancel);
        let handler = chain(backend_responder(200, "hello"), vec![Arc::new(recorder)]);

        drive(&handler, "/api/v1/users/7").await;

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        let buckets = store.route_buckets("/api/v1", from, to);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].request_count, 1);
        assert_eq!(buckets[0].error_count, 0);
        assert_eq!(buckets[0].bytes_out, 5);

        let backends = store.backend_buckets(from, to);
        assert_eq!(backends["http://b1"][0].request_count, 1);
    }

    #[tokio::test]
    async fn five_hundreds_count_as_errors() {
        let store = store();
        let cancel = CancellationToken::new();
        let (recorder, _drain) = TrafficRecorder::new(store.clone(), table(), cancel);
        let handler = chain(backend_responder(503, "down"), vec![Arc::new(recorder)]);

        drive(&handler, "/api/v1/x").await;

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        let bucket = &store.route_buckets("/api/v1", from, to)[0];
        assert_eq!(bucket.error_count, 1);
    }

    #[tokio::test]
    async fn unmatched_path_aggregates_under_raw_path() {
        let store = store();
        let cancel = CancellationToken::new();
        let (recorder, _drain) = TrafficRecorder::new(store.clone(), table(), cancel);
        let handler = chain(backend_responder(200, "x"), vec![Arc::new(recorder)]);

        drive(&handler, "/other").await;

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.route_buckets("/other", from, to)[0].request_count, 1);
    }
}
