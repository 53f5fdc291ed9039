use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use thiserror::Error;

use super::registry::CachedResponse;

/// Headers that describe one hop, not the resource. Never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Request to forward. `target` is an absolute URL for pass-through traffic,
/// otherwise an origin-relative path resolved against the upstream base.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn get(target: &str) -> Self {
        Self {
            method: Method::GET,
            target: target.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Copies end-to-end headers from an incoming request.
    pub fn forwarded(method: Method, target: String, headers: &HeaderMap, body: Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        Self {
            method,
            target,
            headers,
            body,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream timed out")]
    Timeout,

    #[error("upstream unreachable: {0}")]
    Connect(String),

    #[error("invalid upstream request: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: ProxyRequest) -> Result<CachedResponse, UpstreamError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Invalid(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn resolve(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else if target.starts_with('/') {
            format!("{}{}", self.base_url, target)
        } else {
            format!("{}/{}", self.base_url, target)
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: ProxyRequest) -> Result<CachedResponse, UpstreamError> {
        // axum and reqwest sit on different `http` major versions.
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| UpstreamError::Invalid(e.to_string()))?;
        let url = self.resolve(&request.target);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(CachedResponse { status, headers, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else if e.is_builder() {
        UpstreamError::Invalid(e.to_string())
    } else {
        UpstreamError::Connect(e.to_string())
    }
}
