use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::policy::{Fallback, RequestDescriptor, RouteDecision};
use super::registry::{Activation, CacheStatus};
use super::upstream::ProxyRequest;
use crate::errors::ProxyError;
use crate::state::ProxyState;

/// Largest request body the proxy buffers before forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Fallback handler: every request that is not a `/__cache/*` route.
pub async fn intercept(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let descriptor = RequestDescriptor::from_parts(&parts);
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return ProxyError::BodyTooLarge.into_response(),
    };

    match state.registry.route(&descriptor, &state.routing).await {
        RouteDecision::PassThrough => {
            let forward = ProxyRequest::forwarded(parts.method, descriptor.absolute_url(), &parts.headers, body);
            match state.upstream.fetch(forward).await {
                Ok(response) => response.into_response(),
                Err(e) => ProxyError::Upstream(e).into_response(),
            }
        }
        RouteDecision::Serve(cached) => {
            debug!("Cache hit {} {}", descriptor.method, descriptor.path_and_query());
            cached.into_response()
        }
        RouteDecision::Network { store, on_failure } => {
            let target = descriptor.path_and_query();
            let forward = ProxyRequest::forwarded(parts.method, target.clone(), &parts.headers, body);
            match state.upstream.fetch(forward).await {
                Ok(response) => {
                    if store && response.is_success() {
                        state.registry.store(descriptor.key(), response.clone()).await;
                    }
                    response.into_response()
                }
                Err(e) => match on_failure {
                    Fallback::Serve(cached) => {
                        warn!("{} {} failed ({e}), serving cached fallback", descriptor.method, target);
                        cached.into_response()
                    }
                    Fallback::Unavailable => {
                        warn!("{} {} failed ({e}), nothing cached", descriptor.method, target);
                        ProxyError::Offline(target).into_response()
                    }
                    Fallback::None => ProxyError::Upstream(e).into_response(),
                },
            }
        }
    }
}

/// GET /__cache/status
pub async fn cache_status(State(state): State<ProxyState>) -> Json<CacheStatus> {
    Json(state.registry.status().await)
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub version: String,
}

/// POST /__cache/activate
/// Populates and swaps to a new version without restarting the proxy.
pub async fn activate(
    State(state): State<ProxyState>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<Activation>, ProxyError> {
    let activation = state
        .registry
        .activate(&req.version, &state.manifest, state.upstream.as_ref())
        .await?;
    info!("Activated {} via control endpoint", activation.version);
    Ok(Json(activation))
}
