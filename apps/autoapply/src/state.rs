use std::sync::Arc;

use crate::cache::{CacheRegistry, RoutingConfig, Upstream};

/// Shared proxy state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<CacheRegistry>,
    pub upstream: Arc<dyn Upstream>,
    pub routing: Arc<RoutingConfig>,
    /// Assets fetched when a new version is activated at runtime.
    pub manifest: Arc<Vec<String>>,
}

impl ProxyState {
    pub fn new(
        registry: Arc<CacheRegistry>,
        upstream: Arc<dyn Upstream>,
        routing: RoutingConfig,
        manifest: Vec<String>,
    ) -> Self {
        Self {
            registry,
            upstream,
            routing: Arc::new(routing),
            manifest: Arc::new(manifest),
        }
    }
}
