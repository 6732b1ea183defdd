//! Scripted in-memory transport.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use stampede_core::transport::{PreparedRequest, Transport, TransportResponse};
use stampede_core::TransportError;

/// A canned reply for requests whose path ends with `suffix`.
#[derive(Debug, Clone)]
struct Route {
    suffix: String,
    reply: Reply,
}

#[derive(Debug, Clone)]
enum Reply {
    Response { status: u16, body: Value },
    Error(TransportError),
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Transport that answers after a fixed (tokio) delay without touching the
/// network. Works with paused time.
#[derive(Debug, Clone)]
pub struct MockTransport {
    latency: Duration,
    default: Reply,
    routes: Vec<Route>,
    counters: Arc<Counters>,
    log: Arc<Mutex<Vec<PreparedRequest>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// 200 with `{}` for every request, immediately.
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            default: Reply::Response {
                status: 200,
                body: Value::Object(Default::default()),
            },
            routes: Vec::new(),
            counters: Arc::new(Counters::default()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.default = Reply::Response {
            status,
            body: Value::Object(Default::default()),
        };
        self
    }

    pub fn failing(mut self, error: TransportError) -> Self {
        self.default = Reply::Error(error);
        self
    }

    /// Reply to paths ending with `suffix` with `status` and a JSON body.
    pub fn route(mut self, suffix: &str, status: u16, body: Value) -> Self {
        self.routes.push(Route {
            suffix: suffix.to_string(),
            reply: Reply::Response { status, body },
        });
        self
    }

    pub fn route_error(mut self, suffix: &str, error: TransportError) -> Self {
        self.routes.push(Route {
            suffix: suffix.to_string(),
            reply: Reply::Error(error),
        });
        self
    }

    /// Requests started.
    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::SeqCst)
    }

    /// Requests that ran to completion (not dropped mid-flight).
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.log.lock().clone()
    }

    fn reply_for(&self, path: &str) -> Reply {
        self.routes
            .iter()
            .find(|r| path.ends_with(&r.suffix))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

struct InFlightGuard<'a>(&'a Counters);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: PreparedRequest) -> Result<TransportResponse, TransportError> {
        let reply = self.reply_for(request.url.path());
        self.log.lock().push(request);

        self.counters.sent.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.counters);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.counters.completed.fetch_add(1, Ordering::SeqCst);

        match reply {
            Reply::Response { status, body } => Ok(TransportResponse {
                status,
                body: serde_json::to_vec(&body).unwrap_or_default().into(),
            }),
            Reply::Error(e) => Err(e),
        }
    }
}
