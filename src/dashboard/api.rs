use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use super::{EventBus, LogStore};

#[derive(Clone)]
pub struct DashboardState {
    pub logs: Arc<LogStore>,
    pub events: Arc<EventBus>,
}

/// Read-only operator API, mounted at `/dashboard/api`.
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/logs", get(logs))
        .route("/events", get(events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
    status: Option<u16>,
    path: Option<String>,
}

/// `GET /dashboard/api/logs?limit&status&path`: newest-first request logs.
async fn logs(State(state): State<DashboardState>, Query(q): Query<LogsQuery>) -> impl IntoResponse {
    let logs = state
        .logs
        .search(q.limit.unwrap_or(50), q.status, q.path.as_deref());
    Json(json!({ "count": logs.len(), "logs": logs }))
}

/// `GET /dashboard/api/events`: live gateway events over SSE.
async fn events(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|event| async move {
        // Lagged subscribers just skip what they missed.
        let event = event.ok()?;
        let data = serde_json::to_string(&event.data).ok()?;
        Some(Ok(SseEvent::default().event(event.kind).data(data)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
