//! Request routing for the offline cache proxy.
//!
//! `route` is pure: it sees the request descriptor, the current generation
//! and the routing config, and returns what the handler should do. Nothing
//! here touches the network or the registry lock.

use std::fmt;
use std::str::FromStr;

use axum::http::header::ACCEPT;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method};

use super::registry::{CacheGeneration, CachedResponse, RequestKey};

pub const DEFAULT_API_PREFIXES: &[&str] = &["/api/", "/jobs/", "/health"];
pub const DEFAULT_FALLBACK_DOCUMENT: &str = "/index.html";
pub const DEFAULT_OFFLINE_PLACEHOLDER: &str = "/offline.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePolicy {
    /// Successful GET responses are written into the current generation.
    #[default]
    WriteThrough,
    /// Only the activation manifest is ever cached.
    ManifestOnly,
}

impl FromStr for StorePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "write-through" => Ok(Self::WriteThrough),
            "manifest-only" => Ok(Self::ManifestOnly),
            other => Err(format!(
                "unknown store policy '{other}' (expected write-through or manifest-only)"
            )),
        }
    }
}

impl fmt::Display for StorePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteThrough => f.write_str("write-through"),
            Self::ManifestOnly => f.write_str("manifest-only"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Public origin of the proxy, e.g. `http://localhost:8787`.
    pub origin: String,
    pub api_prefixes: Vec<String>,
    pub fallback_document: String,
    pub offline_placeholder: String,
    pub store_policy: StorePolicy,
}

impl RoutingConfig {
    pub fn new(origin: &str, store_policy: StorePolicy) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            api_prefixes: DEFAULT_API_PREFIXES.iter().map(|p| p.to_string()).collect(),
            fallback_document: DEFAULT_FALLBACK_DOCUMENT.to_string(),
            offline_placeholder: DEFAULT_OFFLINE_PLACEHOLDER.to_string(),
            store_policy,
        }
    }

    /// `/api/` style prefixes match by prefix; bare ones like `/health`
    /// match the path itself or anything below it.
    pub fn is_api(&self, path: &str) -> bool {
        self.api_prefixes.iter().any(|prefix| {
            if prefix.ends_with('/') {
                path.starts_with(prefix.as_str())
            } else {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        })
    }

    fn is_cross_origin(&self, origin: Option<&str>) -> bool {
        origin.is_some_and(|o| !o.trim_end_matches('/').eq_ignore_ascii_case(&self.origin))
    }
}

/// What the router knows about one incoming request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Set only for absolute-form request targets.
    pub origin: Option<String>,
    pub path: String,
    pub query: Option<String>,
    /// Top-level document load.
    pub navigate: bool,
}

impl RequestDescriptor {
    pub fn from_parts(parts: &Parts) -> Self {
        let uri = &parts.uri;
        let origin = match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => Some(format!("{scheme}://{authority}")),
            _ => None,
        };
        Self {
            method: parts.method.clone(),
            origin,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            navigate: is_navigation(&parts.method, &parts.headers),
        }
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.path_and_query())
    }

    /// Where pass-through traffic is sent: the original absolute URL.
    pub fn absolute_url(&self) -> String {
        format!("{}{}", self.origin.as_deref().unwrap_or_default(), self.path_and_query())
    }

    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// `Sec-Fetch-Mode: navigate`, or a GET that asks for HTML when the client
/// sends no fetch metadata.
fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    if let Some(mode) = headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok()) {
        return mode.eq_ignore_ascii_case("navigate");
    }
    *method == Method::GET
        && headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

/// `/\.[A-Za-z0-9]+$/` on the path.
pub fn has_static_suffix(path: &str) -> bool {
    match path.rsplit_once('.') {
        Some((_, ext)) => !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Cross-origin: forwarded to its own URL, never cached.
    PassThrough,
    /// Answered from the current generation.
    Serve(CachedResponse),
    /// Forwarded upstream. `store` asks for a write-through on success.
    Network { store: bool, on_failure: Fallback },
}

/// What to answer when the upstream cannot be reached.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    /// Surface the upstream error (502/504).
    None,
    Serve(CachedResponse),
    /// Nothing cached to fall back to (503).
    Unavailable,
}

impl Fallback {
    fn from_cache(response: Option<&CachedResponse>) -> Self {
        response.cloned().map_or(Self::Unavailable, Self::Serve)
    }
}

pub fn route(
    request: &RequestDescriptor,
    generation: Option<&CacheGeneration>,
    config: &RoutingConfig,
) -> RouteDecision {
    if config.is_cross_origin(request.origin.as_deref()) {
        return RouteDecision::PassThrough;
    }

    let cached = |key: &RequestKey| generation.and_then(|g| g.get(key));
    let store = request.method == Method::GET && config.store_policy == StorePolicy::WriteThrough;

    // Network-first. Mutating methods only ever get the placeholder.
    if config.is_api(&request.path) {
        let on_failure = if request.is_read() {
            match cached(&request.key()) {
                Some(hit) => Fallback::Serve(hit.clone()),
                None => Fallback::from_cache(cached(&RequestKey::get(&config.offline_placeholder))),
            }
        } else {
            Fallback::from_cache(cached(&RequestKey::get(&config.offline_placeholder)))
        };
        return RouteDecision::Network { store, on_failure };
    }

    if !request.is_read() {
        return RouteDecision::Network {
            store: false,
            on_failure: Fallback::None,
        };
    }

    if let Some(hit) = cached(&request.key()) {
        return RouteDecision::Serve(hit.clone());
    }

    let on_failure = if request.navigate && !has_static_suffix(&request.path) {
        Fallback::from_cache(cached(&RequestKey::get(&config.fallback_document)))
    } else {
        Fallback::None
    };
    RouteDecision::Network { store, on_failure }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn config() -> RoutingConfig {
        RoutingConfig::new("http://localhost:8787", StorePolicy::WriteThrough)
    }

    fn request(method: Method, path_and_query: &str, navigate: bool) -> RequestDescriptor {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        RequestDescriptor {
            method,
            origin: None,
            path,
            query,
            navigate,
        }
    }

    fn page(body: &'static str) -> CachedResponse {
        CachedResponse::new(200, "text/html", body)
    }

    fn generation() -> CacheGeneration {
        let mut g = CacheGeneration::new("maa-cache-v2");
        g.insert(RequestKey::get("/index.html"), page("index"));
        g.insert(RequestKey::get("/offline.html"), page("offline"));
        g.insert(RequestKey::get("/assets/js/api.js"), CachedResponse::new(200, "text/javascript", "api"));
        g.insert(
            RequestKey::get("/jobs/applications"),
            CachedResponse::new(200, "application/json", "[]"),
        );
        g
    }

    #[test]
    fn test_static_suffix_pattern() {
        assert!(has_static_suffix("/assets/css/app.css"));
        assert!(has_static_suffix("/logo.SVG"));
        assert!(!has_static_suffix("/dashboard"));
        assert!(!has_static_suffix("/"));
        assert!(!has_static_suffix("/file."));
        assert!(!has_static_suffix("/weird.tar-gz"));
    }

    #[test]
    fn test_cross_origin_passes_through() {
        let mut req = request(Method::GET, "/assets/js/api.js", false);
        req.origin = Some("https://cdn.example.com".into());
        assert_eq!(route(&req, Some(&generation()), &config()), RouteDecision::PassThrough);

        req.origin = Some("http://LOCALHOST:8787".into());
        assert!(matches!(route(&req, Some(&generation()), &config()), RouteDecision::Serve(_)));
    }

    #[test]
    fn test_static_asset_is_cache_first() {
        let g = generation();
        match route(&request(Method::GET, "/assets/js/api.js", false), Some(&g), &config()) {
            RouteDecision::Serve(hit) => assert_eq!(&hit.body[..], b"api"),
            other => panic!("expected cache hit, got {other:?}"),
        }

        assert_eq!(
            route(&request(Method::GET, "/assets/js/new.js", false), Some(&g), &config()),
            RouteDecision::Network {
                store: true,
                on_failure: Fallback::None
            }
        );
    }

    #[test]
    fn test_navigation_falls_back_to_index_document() {
        let g = generation();
        let decision = route(&request(Method::GET, "/dashboard", true), Some(&g), &config());
        assert_eq!(
            decision,
            RouteDecision::Network {
                store: true,
                on_failure: Fallback::Serve(page("index"))
            }
        );

        let empty = CacheGeneration::new("v0");
        let decision = route(&request(Method::GET, "/dashboard", true), Some(&empty), &config());
        assert!(matches!(
            decision,
            RouteDecision::Network {
                on_failure: Fallback::Unavailable,
                ..
            }
        ));
    }

    #[test]
    fn test_api_read_falls_back_to_prior_response_then_placeholder() {
        let g = generation();
        let decision = route(&request(Method::GET, "/jobs/applications", false), Some(&g), &config());
        match decision {
            RouteDecision::Network {
                store: true,
                on_failure: Fallback::Serve(hit),
            } => assert_eq!(&hit.body[..], b"[]"),
            other => panic!("unexpected {other:?}"),
        }

        let decision = route(&request(Method::GET, "/jobs/search?q=rust", false), Some(&g), &config());
        assert_eq!(
            decision,
            RouteDecision::Network {
                store: true,
                on_failure: Fallback::Serve(page("offline"))
            }
        );
    }

    #[test]
    fn test_api_is_network_first_even_when_cached() {
        let g = generation();
        let decision = route(&request(Method::GET, "/jobs/applications", false), Some(&g), &config());
        assert!(matches!(decision, RouteDecision::Network { .. }));
    }

    #[test]
    fn test_mutating_api_call_never_served_from_cache() {
        let mut g = generation();
        g.insert(
            RequestKey::new(&Method::POST, "/jobs/apply"),
            CachedResponse::new(201, "application/json", "{}"),
        );
        let decision = route(&request(Method::POST, "/jobs/apply", false), Some(&g), &config());
        assert_eq!(
            decision,
            RouteDecision::Network {
                store: false,
                on_failure: Fallback::Serve(page("offline"))
            }
        );
    }

    #[test]
    fn test_api_namespace_wins_over_static_suffix() {
        let decision = route(&request(Method::GET, "/api/export.csv", false), None, &config());
        assert_eq!(
            decision,
            RouteDecision::Network {
                store: true,
                on_failure: Fallback::Unavailable
            }
        );
    }

    #[test]
    fn test_manifest_only_never_stores() {
        let cfg = RoutingConfig::new("http://localhost:8787", StorePolicy::ManifestOnly);
        for path in ["/health", "/assets/x.js", "/dashboard"] {
            match route(&request(Method::GET, path, true), None, &cfg) {
                RouteDecision::Network { store, .. } => assert!(!store, "{path}"),
                other => panic!("{path}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_api_prefix_matching() {
        let cfg = config();
        assert!(cfg.is_api("/health"));
        assert!(cfg.is_api("/health/db"));
        assert!(!cfg.is_api("/healthz"));
        assert!(cfg.is_api("/api/auth/me"));
        assert!(!cfg.is_api("/apiary"));
    }

    #[test]
    fn test_descriptor_from_absolute_form_request() {
        let (parts, _) = Request::builder()
            .uri("http://cdn.example.com/lib.js?v=2")
            .header("sec-fetch-mode", "no-cors")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let descriptor = RequestDescriptor::from_parts(&parts);

        assert_eq!(descriptor.origin.as_deref(), Some("http://cdn.example.com"));
        assert_eq!(descriptor.path_and_query(), "/lib.js?v=2");
        assert_eq!(descriptor.absolute_url(), "http://cdn.example.com/lib.js?v=2");
        assert!(!descriptor.navigate);
    }

    #[test]
    fn test_navigation_detection() {
        let (parts, _) = Request::builder()
            .uri("/jobs")
            .header("sec-fetch-mode", "navigate")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        assert!(RequestDescriptor::from_parts(&parts).navigate);

        let (parts, _) = Request::builder()
            .uri("/jobs")
            .header("accept", "text/html,application/xhtml+xml")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        assert!(RequestDescriptor::from_parts(&parts).navigate);
    }

    #[test]
    fn test_store_policy_parsing() {
        assert_eq!("write-through".parse::<StorePolicy>(), Ok(StorePolicy::WriteThrough));
        assert_eq!("Manifest_Only".parse::<StorePolicy>(), Ok(StorePolicy::ManifestOnly));
        assert!("sometimes".parse::<StorePolicy>().is_err());
    }
}
