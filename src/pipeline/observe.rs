use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http_body::{Frame, SizeHint};

/// Completion hook fired exactly once with the number of body bytes that
/// reached the client.
pub type OnComplete = Box<dyn FnOnce(u64) + Send + 'static>;

/// Body wrapper that counts data bytes as they stream out and reports the
/// total when the stream ends (or the body is dropped mid-stream, e.g. on
/// client disconnect). Frames pass through unmodified, so streaming
/// responses and trailers behave exactly as they would unwrapped.
pub struct ObservedBody {
    inner: Body,
    counted: u64,
    on_complete: Option<OnComplete>,
}

impl ObservedBody {
    pub fn new(inner: Body, on_complete: OnComplete) -> Self {
        Self {
            inner,
            counted: 0,
            on_complete: Some(on_complete),
        }
    }

    /// Swap a response's body for an observed one. The response status and
    /// headers are untouched; only the byte count is taken from the body.
    pub fn wrap(resp: Response, on_complete: OnComplete) -> Response {
        let (parts, body) = resp.into_parts();
        Response::from_parts(parts, Body::new(ObservedBody::new(body, on_complete)))
    }

    fn finish(&mut self) {
        if let Some(hook) = self.on_complete.take() {
            hook(self.counted);
        }
    }
}

impl http_body::Body for ObservedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counted += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn hook(slot: &Arc<AtomicU64>) -> OnComplete {
        let slot = slot.clone();
        Box::new(move |n| slot.store(n + 1, Ordering::SeqCst))
    }

    #[tokio::test]
    async fn counts_bytes_and_fires_once_at_end() {
        let seen = Arc::new(AtomicU64::new(0));
        let body = ObservedBody::new(Body::from("hello world"), hook(&seen));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello world"));
        // Stored count is bytes + 1 so that "hook fired with 0" is
        // distinguishable from "hook never fired".
        assert_eq!(seen.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn empty_body_reports_zero() {
        let seen = Arc::new(AtomicU64::new(0));
        let body = ObservedBody::new(Body::empty(), hook(&seen));
        body.collect().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_midstream_still_fires() {
        let seen = Arc::new(AtomicU64::new(0));
        let body = ObservedBody::new(Body::from("abc"), hook(&seen));
        drop(body);
        assert_eq!(seen.load(Ordering::SeqCst), 1); // fired with 0 bytes counted
    }

    #[tokio::test]
    async fn wrap_preserves_status_and_headers() {
        let seen = Arc::new(AtomicU64::new(0));
        let resp = Response::builder()
            .status(axum::http::StatusCode::CREATED)
            .header("x-proxy-backend", "http://b1")
            .body(Body::from("ok"))
            .unwrap();
        let wrapped = ObservedBody::wrap(resp, hook(&seen));
        assert_eq!(wrapped.status(), axum::http::StatusCode::CREATED);
        assert_eq!(wrapped.headers()["x-proxy-backend"], "http://b1");
        wrapped.into_body().collect().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
