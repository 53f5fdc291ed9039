pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::cache::handlers;
use crate::state::ProxyState;

/// Control routes live under `/__cache/`; everything else is intercepted.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/__cache/health", get(health::health_handler))
        .route("/__cache/status", get(handlers::cache_status))
        .route("/__cache/activate", post(handlers::activate))
        .fallback(handlers::intercept)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
