use std::time::Instant;

use tracing::info;

use super::request_id::RequestId;
use super::{client_ip, Handler, Stage};

/// Emits one structured access-log line per request after the response
/// head is known.
pub struct LoggingStage;

impl Stage for LoggingStage {
    fn wrap(&self, next: Handler) -> Handler {
        Handler::new(move |req| {
            let next = next.clone();
            async move {
                let start = Instant::now();
                let method = req.method().to_string();
                let path = req.uri().path().to_string();
                let client = client_ip(&req);
                let request_id = RequestId::get(req.extensions())
                    .unwrap_or_default()
                    .to_string();

                let resp = next.call(req).await;

                info!(
                    target: "gateway::access",
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    status = resp.status().as_u16(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    client_ip = %client,
                    "request completed"
                );

                resp
            }
        })
    }
}
