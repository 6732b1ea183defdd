//! Error types for load generation.

use thiserror::Error;

/// Result type alias using LoadError.
pub type LoadResult<T> = Result<T, LoadError>;

/// Configuration-level errors. All of them are fatal and raised before any
/// virtual user is spawned.
#[derive(Debug, Error)]
pub enum LoadError {
    // === Registry Errors ===
    #[error("Scenario already registered: {0}")]
    DuplicateName(String),

    #[error("No scenario registered")]
    EmptyRegistry,

    #[error("No scenario matches tags (include: [{include}], exclude: [{exclude}])")]
    NoMatchingScenarios { include: String, exclude: String },

    #[error("Invalid weight {weight} for '{name}': weights must be finite and >= 0")]
    InvalidWeight { name: String, weight: f64 },

    #[error("All registered weights are zero")]
    ZeroTotalWeight,

    #[error("Scenario '{0}' declares no actions")]
    EmptyScenario(String),

    #[error("Action '{scenario}/{action}' declares no request steps")]
    EmptyAction { scenario: String, action: String },

    // === Template Errors ===
    #[error("Invalid request template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    // === Run Configuration Errors ===
    #[error("Invalid target host '{host}': {message}")]
    InvalidHost { host: String, message: String },

    #[error("Invalid parameter value for '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse scenario file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Export failed: {0}")]
    Export(String),

    // === Runtime Errors ===
    #[error("Scheduler task failed: {0}")]
    Scheduler(String),
}

impl LoadError {
    pub(crate) fn invalid_param(param: &str, message: impl Into<String>) -> Self {
        LoadError::InvalidParameter {
            param: param.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_template(template: &str, message: impl Into<String>) -> Self {
        LoadError::InvalidTemplate {
            template: template.to_string(),
            message: message.into(),
        }
    }
}

impl From<csv::Error> for LoadError {
    fn from(err: csv::Error) -> Self {
        LoadError::Export(format!("CSV error: {}", err))
    }
}

/// Per-request transport failure. Never fatal: the runner turns it into a
/// failed outcome and keeps going.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timeout")]
    Timeout,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout;
        }
        let is_connect = err.is_connect();
        // The URL carries per-request path parameters; keep it out of the
        // message so failures group by cause.
        let message = error_chain(&err.without_url());
        let lowered = message.to_lowercase();
        if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("handshake") {
            TransportError::Tls(message)
        } else if is_connect && lowered.contains("refused") {
            TransportError::ConnectionRefused(message)
        } else if is_connect {
            TransportError::Connect(message)
        } else {
            TransportError::Other(message)
        }
    }
}

/// reqwest keeps the useful part (e.g. "Connection refused (os error 111)")
/// in the source chain. Some layers already print their source in `Display`,
/// so text seen earlier in the chain is not repeated.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}
