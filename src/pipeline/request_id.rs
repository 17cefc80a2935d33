use axum::http::{header::HeaderName, Extensions, HeaderValue};
use uuid::Uuid;

use super::{Handler, Stage};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Typed request attribute carrying the request id. Being a private newtype
/// in this module's `Extensions` slot, no other component can collide with
/// or overwrite it accidentally.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    /// Read the request id a [`RequestIdStage`] attached upstream.
    pub fn get(extensions: &Extensions) -> Option<&str> {
        extensions.get::<RequestId>().map(|id| id.0.as_str())
    }
}

/// Assigns a unique id to every request, reusing a client-supplied
/// `X-Request-ID` so distributed traces stay connected. The id is attached
/// to the request as a typed extension and stamped on every response,
/// including error responses produced further down the chain.
pub struct RequestIdStage;

impl Stage for RequestIdStage {
    fn wrap(&self, next: Handler) -> Handler {
        Handler::new(move |mut req| {
            let next = next.clone();
            async move {
                let id = req
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                req.extensions_mut().insert(RequestId(id.clone()));

                let mut resp = next.call(req).await;
                if let Ok(value) = HeaderValue::from_str(&id) {
                    resp.headers_mut()
                        .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
                }
                resp
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
    use std::sync::Arc;

    fn echo_id_handler() -> Handler {
        Handler::new(|req: Request| async move {
            let id = RequestId::get(req.extensions()).unwrap_or("missing").to_string();
            Response::builder()
                .header("x-seen-id", id)
                .body(Body::empty())
                .unwrap()
        })
    }

    #[tokio::test]
    async fn assigns_fresh_id_and_stamps_response() {
        let handler = chain(echo_id_handler(), vec![Arc::new(RequestIdStage)]);
        let resp = handler
            .call(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;

        let header = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(!header.is_empty());
        // The handler saw the same id the client received.
        assert_eq!(resp.headers()["x-seen-id"], header);
    }

    #[tokio::test]
    async fn reuses_client_supplied_id() {
        let handler = chain(echo_id_handler(), vec![Arc::new(RequestIdStage)]);
        let req = Request::builder()
            .uri("/")
            .header(REQUEST_ID_HEADER, "trace-42")
            .body(Body::empty())
            .unwrap();
        let resp = handler.call(req).await;
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "trace-42");
        assert_eq!(resp.headers()["x-seen-id"], "trace-42");
    }

    #[tokio::test]
    async fn distinct_requests_get_distinct_ids() {
        let handler = chain(echo_id_handler(), vec![Arc::new(RequestIdStage)]);
        let first = handler
            .call(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        let second = handler
            .call(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_ne!(
            first.headers()[REQUEST_ID_HEADER],
            second.headers()[REQUEST_ID_HEADER]
        );
    }
}
