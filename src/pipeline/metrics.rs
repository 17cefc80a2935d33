use std::time::Instant;

use metrics::{counter, histogram};

use super::{Handler, Stage};

/// Records the request counter and latency histogram for every request,
/// labeled by method, path, and final status.
pub struct MetricsStage;

impl Stage for MetricsStage {
    fn wrap(&self, next: Handler) -> Handler {
        Handler::new(move |req| {
            let next = next.clone();
            async move {
                let start = Instant::now();
                let method = req.method().to_string();
                let path = req.uri().path().to_string();

                let resp = next.call(req).await;

                let duration = start.elapsed().as_secs_f64();
                counter!(
                    "gateway_http_requests_total",
                    "method" => method.clone(),
                    "path" => path.clone(),
                    "status" => resp.status().as_u16().to_string()
                )
                .increment(1);
                histogram!(
                    "gateway_http_request_duration_seconds",
                    "method" => method,
                    "path" => path
                )
                .record(duration);

                resp
            }
        })
    }
}
