use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::observe::ObservedBody;
use super::request_id::RequestId;
use super::{client_ip, Handler, Stage};
use crate::dashboard::{EventBus, LogStore, RequestLog};
use crate::proxy::PROXY_BACKEND_HEADER;

const CHANNEL_CAPACITY: usize = 256;

/// Pushes one [`RequestLog`] per completed request into the dashboard's
/// ring buffer (and onto the live event stream) through a bounded channel.
/// Same drop-on-full contract as the traffic recorder: never block the
/// response path for observability.
pub struct LogCaptureStage {
    logs: mpsc::Sender<RequestLog>,
}

impl LogCaptureStage {
    /// Returns the capture stage and its drain task.
    pub fn new(
        store: Arc<LogStore>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(CHANNEL_CAPACITY);

        let drain = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    log = rx.recv() => match log {
                        Some(log) => {
                            events.publish("request", &log);
                            store.add(log);
                        }
                        None => break,
                    },
                }
            }
            info!("log capture drain stopped");
        });

        (Self { logs: tx }, drain)
    }
}

impl Stage for LogCaptureStage {
    fn wrap(&self, next: Handler) -> Handler {
        let logs = self.logs.clone();
        Handler::new(move |req| {
            let next = next.clone();
            let logs = logs.clone();
            async move {
                let start = Instant::now();
                let started_at = Utc::now();
                let id = RequestId::get(req.extensions())
                    .unwrap_or_default()
                    .to_string();
                let method = req.method().to_string();
                let path = req.uri().path().to_string();
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

                ObservedBody::wrap(
                    resp,
                    Box::new(move |bytes_out| {
                        let log = RequestLog {
                            id,
                            timestamp: started_at,
                            method,
                            path,
                            status,
                            latency_ms: start.elapsed().as_millis() as u64,
                            client_ip: client,
                            bytes_in,
                            bytes_out,
                            backend,
                        };
                        let _ = logs.try_send(log);
                    }),
                )
            }
        })
    }
}
