//! Credential context handed to every virtual user.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::{LoadError, LoadResult};

pub const DEFAULT_TOKEN: &str = "test-token";
pub const DEFAULT_TENANT_HEADER: &str = "X-Agency-Id";

/// Bearer token and tenant identifier used for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub tenant_id: String,
    pub tenant_header: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            tenant_id: tenant_id.into(),
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
        }
    }

    /// Defaults used when the environment supplies nothing: the placeholder
    /// token and a fresh tenant id.
    pub fn anonymous() -> Self {
        Self::new(DEFAULT_TOKEN, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_tenant_header(mut self, header: impl Into<String>) -> Self {
        self.tenant_header = header.into();
        self
    }

    /// Headers attached to every request of a virtual user.
    pub fn headers(&self) -> LoadResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|_| LoadError::invalid_param("auth_token", "not a valid header value"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let name = HeaderName::from_bytes(self.tenant_header.as_bytes())
            .map_err(|_| LoadError::invalid_param("tenant_header", "not a valid header name"))?;
        let value = HeaderValue::from_str(&self.tenant_id)
            .map_err(|_| LoadError::invalid_param("tenant_id", "not a valid header value"))?;
        headers.insert(name, value);
        Ok(headers)
    }
}
