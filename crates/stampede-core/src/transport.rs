//! HTTP transport seam between the action runner and the network.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde_json::Value;

use crate::error::{LoadError, LoadResult, TransportError};

/// A fully rendered request, ready to send.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

/// What came back from the target.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Sends one request. Implementations report failures below HTTP as
/// [`TransportError`]; any status code is a successful transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: PreparedRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport shared by every virtual user.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, max_idle_per_host: usize) -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| LoadError::invalid_param("http_client", e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: PreparedRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(TransportResponse { status, body })
    }
}

/// Validate and normalize the target host (scheme and authority, optional
/// base path, no trailing slash).
pub fn parse_host(host: &str) -> LoadResult<Url> {
    let invalid = |message: &str| LoadError::InvalidHost {
        host: host.to_string(),
        message: message.to_string(),
    };

    let url = Url::parse(host.trim_end_matches('/')).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("host must not carry a query or fragment"));
    }
    Ok(url)
}

/// Append a rendered path (which may carry its own query string) to the host.
pub fn join_url(host: &Url, path: &str) -> Result<Url, TransportError> {
    let base = host.as_str().trim_end_matches('/');
    Url::parse(&format!("{}{}", base, path))
        .map_err(|e| TransportError::Other(format!("invalid URL '{}{}': {}", base, path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host() {
        let url = parse_host("http://localhost:8000/").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/");
        assert!(parse_host("https://api.example.com/base").is_ok());
        assert!(parse_host("localhost:8000").is_err());
        assert!(parse_host("ftp://example.com").is_err());
        assert!(parse_host("http://example.com/?q=1").is_err());
    }

    #[test]
    fn test_join_url() {
        let host = parse_host("http://localhost:8000").unwrap();
        let url = join_url(&host, "/api/agents/?view=tree").unwrap();
        assert_eq!(url.path(), "/api/agents/");
        assert_eq!(url.query(), Some("view=tree"));

        let host = parse_host("https://example.com/base/").unwrap();
        let url = join_url(&host, "/api/x").unwrap();
        assert_eq!(url.as_str(), "https://example.com/base/api/x");
    }
}
