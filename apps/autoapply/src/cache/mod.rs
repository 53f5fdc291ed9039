/// Offline Cache Proxy: a local HTTP server that sits in front of the
/// frontend and the API.
///
/// Static assets come from a versioned cache generation, API calls go
/// network-first with a cached fallback. Routing is decided by the pure
/// `policy::route`; the handler only executes the decision.
use thiserror::Error;

pub mod handlers;
pub mod policy;
pub mod registry;
pub mod upstream;

pub use policy::{RoutingConfig, StorePolicy};
pub use registry::{CacheRegistry, CachedResponse, RequestKey};
pub use upstream::{HttpUpstream, Upstream};

pub const DEFAULT_CACHE_VERSION: &str = "maa-cache-v2";

/// Shell assets fetched on every activation.
pub const DEFAULT_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    "/login.html",
    "/signup.html",
    "/jobs.html",
    "/dashboard.html",
    "/revamp.html",
    "/cover_letter.html",
    "/subscription.html",
    "/pay.html",
    "/settings.html",
    "/offline.html",
    "/assets/css/app.css",
    "/assets/js/config.js",
    "/assets/js/api.js",
    "/assets/js/auth.js",
    "/assets/js/ui.js",
    "/assets/js/app.js",
    "/assets/js/jobs.js",
    "/assets/js/dashboard.js",
    "/assets/js/revamp.js",
    "/assets/js/cover_letter.js",
    "/assets/js/subscription.js",
    "/assets/js/pay.js",
    "/assets/img/logo.svg",
];

pub fn default_manifest() -> Vec<String> {
    DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Activating {version}: could not fetch {path}: {reason}")]
    Populate {
        version: String,
        path: String,
        reason: String,
    },

    #[error("Activating {version}: {path} returned HTTP {status}")]
    BadStatus {
        version: String,
        path: String,
        status: u16,
    },
}
