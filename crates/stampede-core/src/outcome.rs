//! The record produced for every issued request.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::scenario::Tags;

/// One issued request and how it ended. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: u64,
    pub user_id: u64,
    pub method: Method,
    /// Statistics grouping key.
    pub name: String,
    pub tags: Tags,
    pub started_at: DateTime<Utc>,
    pub latency: Duration,
    pub bytes: u64,
    pub kind: OutcomeKind,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Success { .. })
    }

    pub fn failure(&self) -> Option<&FailureKind> {
        match &self.kind {
            OutcomeKind::Failure(f) => Some(f),
            OutcomeKind::Success { .. } => None,
        }
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::from_std(self.latency).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Exactly one category per outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    Success { status: u16 },
    Failure(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The server answered with a status the request does not accept.
    Status(u16),
    Timeout,
    ConnectionRefused(String),
    Connect(String),
    Tls(String),
    Transport(String),
    /// Abandoned in flight by a hard stop.
    Cancelled,
}

impl FailureKind {
    /// Short label used in live logs and CSV columns.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Status(_) => "status",
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused(_) => "connection_refused",
            FailureKind::Connect(_) => "connect",
            FailureKind::Tls(_) => "tls",
            FailureKind::Transport(_) => "transport",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Failures raised below HTTP (no response was received).
    pub fn is_transport(&self) -> bool {
        !matches!(self, FailureKind::Status(_) | FailureKind::Cancelled)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Status(401) => write!(f, "HTTP 401: Authentication required"),
            FailureKind::Status(code) => write!(f, "HTTP {}: Unexpected status", code),
            FailureKind::Timeout => write!(f, "Request timeout"),
            FailureKind::ConnectionRefused(msg) => write!(f, "Connection refused: {}", msg),
            FailureKind::Connect(msg) => write!(f, "Connection failed: {}", msg),
            FailureKind::Tls(msg) => write!(f, "TLS failure: {}", msg),
            FailureKind::Transport(msg) => write!(f, "Transport error: {}", msg),
            FailureKind::Cancelled => write!(f, "Cancelled in flight"),
        }
    }
}

impl From<TransportError> for FailureKind {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => FailureKind::Timeout,
            TransportError::ConnectionRefused(m) => FailureKind::ConnectionRefused(m),
            TransportError::Connect(m) => FailureKind::Connect(m),
            TransportError::Tls(m) => FailureKind::Tls(m),
            TransportError::Other(m) => FailureKind::Transport(m),
        }
    }
}
