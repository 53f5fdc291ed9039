use std::collections::HashMap;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::policy::{self, RequestDescriptor, RouteDecision, RoutingConfig};
use super::upstream::{ProxyRequest, Upstream};
use super::CacheError;

/// Cache key: method plus origin-relative path and query.
/// HEAD shares GET's entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: String,
    pub path_and_query: String,
}

impl RequestKey {
    pub fn new(method: &Method, path_and_query: &str) -> Self {
        let method = if method == Method::HEAD { Method::GET } else { method.clone() };
        Self {
            method: method.as_str().to_string(),
            path_and_query: path_and_query.to_string(),
        }
    }

    pub fn get(path_and_query: &str) -> Self {
        Self::new(&Method::GET, path_and_query)
    }
}

/// A fully buffered response, as stored in a generation or received upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            // Invalid names or values from upstream are dropped.
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        response
    }
}

/// All cached responses for one version string.
#[derive(Debug, Clone)]
pub struct CacheGeneration {
    version: String,
    entries: HashMap<RequestKey, CachedResponse>,
}

impl CacheGeneration {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, key: &RequestKey) -> Option<&CachedResponse> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: RequestKey, response: CachedResponse) {
        self.entries.insert(key, response);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub version: Option<String>,
    pub entries: usize,
    /// Every generation still held. Outside an activation this is at most one.
    pub generations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub version: String,
    pub entries: usize,
    pub removed: Vec<String>,
    /// False when the version was already current and nothing was fetched.
    pub swapped: bool,
}

#[derive(Default)]
struct Generations {
    current: Option<String>,
    by_version: HashMap<String, CacheGeneration>,
}

impl Generations {
    fn current(&self) -> Option<&CacheGeneration> {
        self.current.as_ref().and_then(|v| self.by_version.get(v))
    }
}

/// Versioned response cache. Exactly one generation is current once the
/// first activation has completed.
#[derive(Default)]
pub struct CacheRegistry {
    inner: RwLock<Generations>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates `version` from `manifest`, then deletes every other
    /// generation and makes it current, in one write-locked step.
    ///
    /// The previous generation keeps serving while the manifest is fetched.
    /// Any failed or non-2xx asset aborts the activation and leaves it as is.
    pub async fn activate(
        &self,
        version: &str,
        manifest: &[String],
        upstream: &dyn Upstream,
    ) -> Result<Activation, CacheError> {
        if let Some(current) = self.inner.read().await.current() {
            if current.version() == version {
                debug!("Cache {version} already active");
                return Ok(Activation {
                    version: version.to_string(),
                    entries: current.len(),
                    removed: Vec::new(),
                    swapped: false,
                });
            }
        }

        info!("Populating cache {version} from {} manifest entries", manifest.len());
        let mut generation = CacheGeneration::new(version);
        for path in manifest {
            let response = upstream
                .fetch(ProxyRequest::get(path))
                .await
                .map_err(|e| CacheError::Populate {
                    version: version.to_string(),
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            if !response.is_success() {
                return Err(CacheError::BadStatus {
                    version: version.to_string(),
                    path: path.clone(),
                    status: response.status,
                });
            }
            generation.insert(RequestKey::get(path), response);
        }

        let entries = generation.len();
        let mut state = self.inner.write().await;
        let removed: Vec<String> = state
            .by_version
            .drain()
            .map(|(v, _)| v)
            .filter(|v| v != version)
            .collect();
        state.by_version.insert(version.to_string(), generation);
        state.current = Some(version.to_string());
        drop(state);

        info!("Cache {version} active with {entries} entries, removed {removed:?}");
        Ok(Activation {
            version: version.to_string(),
            entries,
            removed,
            swapped: true,
        })
    }

    /// Routes a request against the current generation.
    pub async fn route(&self, request: &RequestDescriptor, config: &RoutingConfig) -> RouteDecision {
        let state = self.inner.read().await;
        policy::route(request, state.current(), config)
    }

    #[cfg(test)]
    pub async fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
        self.inner.read().await.current().and_then(|g| g.get(key)).cloned()
    }

    /// Writes into the current generation. A no-op before the first activation.
    pub async fn store(&self, key: RequestKey, response: CachedResponse) {
        let mut state = self.inner.write().await;
        let Some(version) = state.current.clone() else {
            return;
        };
        if let Some(generation) = state.by_version.get_mut(&version) {
            debug!("Cached {} {} in {version}", key.method, key.path_and_query);
            generation.insert(key, response);
        }
    }

    pub async fn current_version(&self) -> Option<String> {
        self.inner.read().await.current.clone()
    }

    pub async fn status(&self) -> CacheStatus {
        let state = self.inner.read().await;
        let mut generations: Vec<String> = state.by_version.keys().cloned().collect();
        generations.sort();
        CacheStatus {
            version: state.current.clone(),
            entries: state.current().map(CacheGeneration::len).unwrap_or(0),
            generations,
        }
    }
}
