#![allow(dead_code)]

pub mod api;

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// One HTTP request as seen by the gateway, for the operator log view.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub client_ip: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub backend: Option<String>,
}

/// Fixed-capacity ring buffer of recent request logs.
pub struct LogStore {
    inner: RwLock<VecDeque<RequestLog>>,
    capacity: usize,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 1000 } else { capacity };
        Self {
            inner: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn add(&self, log: RequestLog) {
        let mut inner = self.inner.write().unwrap();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(log);
    }

    /// The `n` most recent logs, newest first.
    pub fn recent(&self, n: usize) -> Vec<RequestLog> {
        let inner = self.inner.read().unwrap();
        inner.iter().rev().take(n).cloned().collect()
    }

    /// Newest-first logs filtered by exact status and/or path substring.
    pub fn search(&self, limit: usize, status: Option<u16>, path: Option<&str>) -> Vec<RequestLog> {
        let limit = if limit == 0 { 50 } else { limit };
        let inner = self.inner.read().unwrap();
        inner
            .iter()
            .rev()
            .filter(|log| status.map_or(true, |s| log.status == s))
            .filter(|log| path.map_or(true, |p| log.path.contains(p)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A typed event on the operator stream.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: &'static str,
    pub data: serde_json::Value,
}

/// Broadcast bus feeding the SSE endpoint. Publishing never blocks; slow or
/// absent subscribers simply miss events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(if buffer == 0 { 256 } else { buffer });
        Self { tx }
    }

    pub fn publish<T: Serialize>(&self, kind: &'static str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(data) => {
                let _ = self.tx.send(Event { kind, data });
            }
            Err(err) => debug!(kind, error = %err, "failed to serialize event"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
