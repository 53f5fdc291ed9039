use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::ProxyState;

/// GET /__cache/health
/// Liveness of the proxy itself. `/health` belongs to the upstream API.
pub async fn health_handler(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "autoapply-proxy",
        "cache_version": state.registry.current_version().await,
        "store_policy": state.routing.store_policy.to_string()
    }))
}
